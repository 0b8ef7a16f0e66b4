//! Defines routes for story operations.
//!
//! ## Structure
//! - **Health endpoints**
//!   - `GET    /healthz` — liveness
//!   - `GET    /readyz` — readiness (index ping + content store probe)
//!
//! - **Story endpoints**
//!   - `POST   /stories` — publish a story
//!   - `GET    /stories` — list (authorDid, tags, sortBy, sortOrder, offset, limit)
//!   - `GET    /stories/count` — count with the same filters
//!   - `GET    /stories/search` — substring search over title and excerpt
//!   - `GET    /stories/{id}` — record plus content
//!   - `PATCH  /stories/{id}` — revise
//!   - `DELETE /stories/{id}` — remove record and content
//!   - `GET    /authors/{did}/stories` — one author's stories

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        story_handlers::{
            count_stories, delete_story, get_story, list_author_stories, list_stories,
            publish_story, revise_story, search_stories,
        },
    },
    services::story_service::StoryService,
};
use axum::{Router, routing::get};

/// Build and return the router for all routes.
///
/// The router carries shared state (`StoryService`) to all handlers.
pub fn routes() -> Router<StoryService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Story routes; static segments win over `{id}`
        .route("/stories", get(list_stories).post(publish_story))
        .route("/stories/count", get(count_stories))
        .route("/stories/search", get(search_stories))
        .route(
            "/stories/{id}",
            get(get_story).patch(revise_story).delete(delete_story),
        )
        .route("/authors/{did}/stories", get(list_author_stories))
}
