//! HTTP handlers for story operations. Bodies are JSON in camelCase; all
//! storage concerns are delegated to `StoryService`.

use crate::{
    errors::AppError,
    models::{Page, SearchQuery, SortField, SortOrder, StoryMetadata, StoryQuery},
    services::story_service::{PublishStory, RevisionInput, StoryService, StoryWithContent},
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Query params accepted by the listing endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListStoriesQuery {
    pub author_did: Option<String>,
    /// Comma-separated; a story must carry all of them.
    pub tags: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl ListStoriesQuery {
    fn into_story_query(self) -> Result<StoryQuery, AppError> {
        let sort_by = match self.sort_by.as_deref() {
            Some(raw) => raw.parse::<SortField>().map_err(bad_request)?,
            None => SortField::default(),
        };
        let sort_order = match self.sort_order.as_deref() {
            Some(raw) => raw.parse::<SortOrder>().map_err(bad_request)?,
            None => SortOrder::default(),
        };
        let tags = self
            .tags
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(StoryQuery {
            author_did: self.author_did,
            tags,
            sort_by,
            sort_order,
            offset: self.offset.unwrap_or(0),
            limit: self.limit,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchStoriesQuery {
    pub q: String,
    pub author_did: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

fn bad_request(msg: String) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, msg)
}

fn story_not_found(id: Uuid) -> AppError {
    AppError::not_found(format!("story `{}` not found", id))
}

/// `POST /stories`
pub async fn publish_story(
    State(service): State<StoryService>,
    Json(input): Json<PublishStory>,
) -> Result<impl IntoResponse, AppError> {
    let story = service.publish(input).await?;
    Ok((StatusCode::CREATED, Json(story)))
}

/// `GET /stories`
pub async fn list_stories(
    State(service): State<StoryService>,
    Query(params): Query<ListStoriesQuery>,
) -> Result<Json<Page>, AppError> {
    let query = params.into_story_query()?;
    Ok(Json(service.list(&query).await?))
}

/// `GET /stories/count` — same filters as the listing, pagination ignored.
pub async fn count_stories(
    State(service): State<StoryService>,
    Query(params): Query<ListStoriesQuery>,
) -> Result<Json<CountResponse>, AppError> {
    let query = params.into_story_query()?;
    let count = service.count(&query).await?;
    Ok(Json(CountResponse { count }))
}

/// `GET /stories/search?q=`
pub async fn search_stories(
    State(service): State<StoryService>,
    Query(params): Query<SearchStoriesQuery>,
) -> Result<Json<Page>, AppError> {
    let query = SearchQuery {
        query: params.q,
        author_did: params.author_did,
        offset: params.offset.unwrap_or(0),
        limit: params.limit,
    };
    Ok(Json(service.search(&query).await?))
}

/// `GET /authors/{did}/stories`
pub async fn list_author_stories(
    State(service): State<StoryService>,
    Path(author_did): Path<String>,
    Query(params): Query<ListStoriesQuery>,
) -> Result<Json<Page>, AppError> {
    let query = params.into_story_query()?;
    Ok(Json(service.list_by_author(&author_did, &query).await?))
}

/// `GET /stories/{id}` — record plus content.
pub async fn get_story(
    State(service): State<StoryService>,
    Path(id): Path<Uuid>,
) -> Result<Json<StoryWithContent>, AppError> {
    match service.read(id).await? {
        Some(story) => Ok(Json(story)),
        None => Err(story_not_found(id)),
    }
}

/// `PATCH /stories/{id}`
pub async fn revise_story(
    State(service): State<StoryService>,
    Path(id): Path<Uuid>,
    Json(input): Json<RevisionInput>,
) -> Result<Json<StoryMetadata>, AppError> {
    match service.revise(id, input).await? {
        Some(story) => Ok(Json(story)),
        None => Err(story_not_found(id)),
    }
}

/// `DELETE /stories/{id}`
pub async fn delete_story(
    State(service): State<StoryService>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if service.remove(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(story_not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_params_map_onto_a_story_query() {
        let params = ListStoriesQuery {
            tags: Some("Fiction, grief,,".into()),
            sort_by: Some("title".into()),
            sort_order: Some("ASC".into()),
            limit: Some(5),
            ..ListStoriesQuery::default()
        };
        let query = params.into_story_query().unwrap();
        assert_eq!(query.tags, ["fiction", "grief"]);
        assert_eq!(query.sort_by, SortField::Title);
        assert_eq!(query.sort_order, SortOrder::Asc);
        assert_eq!(query.page_size(), 5);
    }

    #[test]
    fn unknown_sort_field_is_a_bad_request() {
        let params = ListStoriesQuery {
            sort_by: Some("wordCount".into()),
            ..ListStoriesQuery::default()
        };
        let err = params.into_story_query().unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
