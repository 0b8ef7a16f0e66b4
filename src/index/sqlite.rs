//! SqliteIndex — embedded SQL metadata index.
//!
//! One `stories` table keyed by `id` with a unique constraint on
//! `storage_key`; see `migrations/sqlite/0001_init.sql`. Timestamps are stored
//! as epoch microseconds so that ordering never depends on text formatting,
//! and tags as a JSON array filtered with `json_each`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, QueryBuilder, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    types::Json,
};
use std::{str::FromStr, time::Duration};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{MetadataIndex, is_unique_violation, like_pattern, migration_statements};
use crate::errors::{StorageError, StorageResult};
use crate::models::{NewStory, Page, SearchQuery, StoryMetadata, StoryPatch, StoryQuery};

const MIGRATION: &str = include_str!("../../migrations/sqlite/0001_init.sql");

const STORY_COLUMNS: &str = "id, title, author_did, author_name, storage_key, word_count, \
     excerpt, tags, published_at, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct SqliteIndex {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct StoryRow {
    id: Uuid,
    title: String,
    author_did: String,
    author_name: String,
    storage_key: String,
    word_count: i64,
    excerpt: Option<String>,
    tags: Json<Vec<String>>,
    published_at: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<StoryRow> for StoryMetadata {
    type Error = StorageError;

    fn try_from(row: StoryRow) -> StorageResult<Self> {
        Ok(StoryMetadata {
            id: row.id,
            title: row.title,
            author_did: row.author_did,
            author_name: row.author_name,
            storage_key: row.storage_key,
            word_count: u32::try_from(row.word_count)
                .map_err(|_| StorageError::Corrupt(format!("word_count {}", row.word_count)))?,
            excerpt: row.excerpt,
            tags: row.tags.0,
            published_at: from_micros(row.published_at)?,
            created_at: from_micros(row.created_at)?,
            updated_at: from_micros(row.updated_at)?,
        })
    }
}

fn from_micros(value: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp {} out of range", value)))
}

impl SqliteIndex {
    /// Open (creating if missing) the database at `database_url` and apply
    /// the schema.
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let in_memory = database_url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StorageError::Config(format!("invalid sqlite url `{}`: {}", database_url, e)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let options = if in_memory {
            options
        } else {
            // Create parent directory if needed
            let db_path = options.get_filename().to_path_buf();
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if !parent.exists() {
                    tokio::fs::create_dir_all(parent).await?;
                    info!("Created missing directory {:?}", parent);
                }
            }
            debug!("Interpreted SQLite path => {}", db_path.display());
            options.journal_mode(SqliteJournalMode::Wal)
        };

        // An in-memory database lives and dies with its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StorageError::unavailable("sqlite", e))?;

        let index = Self { pool };
        index.run_migrations().await?;
        Ok(index)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        let statements = migration_statements(MIGRATION);
        debug!("Running {} sqlite migration statements...", statements.len());
        for stmt in statements {
            sqlx::query(&stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> StorageResult<Option<StoryMetadata>> {
        let sql = format!("SELECT {} FROM stories WHERE id = ?", STORY_COLUMNS);
        sqlx::query_as::<_, StoryRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(StoryMetadata::try_from)
            .transpose()
    }

    async fn page(
        &self,
        filters: impl Fn(&mut QueryBuilder<'static, Sqlite>),
        order_by: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Page> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM stories WHERE 1 = 1");
        filters(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM stories WHERE 1 = 1", STORY_COLUMNS));
        filters(&mut select);
        select.push(" ORDER BY ");
        select.push(order_by);
        select.push(" LIMIT ");
        select.push_bind(limit as i64);
        select.push(" OFFSET ");
        select.push_bind(i64::try_from(offset).unwrap_or(i64::MAX));

        let rows: Vec<StoryRow> = select.build_query_as().fetch_all(&self.pool).await?;
        let stories = rows
            .into_iter()
            .map(StoryMetadata::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(Page::new(stories, total.max(0) as u64, offset))
    }
}

fn push_story_filters(builder: &mut QueryBuilder<'static, Sqlite>, options: &StoryQuery) {
    if let Some(did) = &options.author_did {
        builder.push(" AND author_did = ");
        builder.push_bind(did.clone());
    }
    for tag in &options.tags {
        builder.push(" AND EXISTS (SELECT 1 FROM json_each(stories.tags) WHERE json_each.value = ");
        builder.push_bind(tag.clone());
        builder.push(")");
    }
}

fn push_search_filters(builder: &mut QueryBuilder<'static, Sqlite>, options: &SearchQuery) {
    let pattern = like_pattern(&options.needle());
    builder.push(" AND (lower(title) LIKE ");
    builder.push_bind(pattern.clone());
    builder.push(r" ESCAPE '\' OR lower(COALESCE(excerpt, '')) LIKE ");
    builder.push_bind(pattern);
    builder.push(r" ESCAPE '\')");
    if let Some(did) = &options.author_did {
        builder.push(" AND author_did = ");
        builder.push_bind(did.clone());
    }
}

#[async_trait]
impl MetadataIndex for SqliteIndex {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self, input), fields(storage_key = %input.storage_key))]
    async fn create(&self, input: NewStory) -> StorageResult<StoryMetadata> {
        let story = input.into_metadata(Uuid::new_v4(), Utc::now());
        let sql = format!(
            "INSERT INTO stories ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            STORY_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(story.id)
            .bind(&story.title)
            .bind(&story.author_did)
            .bind(&story.author_name)
            .bind(&story.storage_key)
            .bind(i64::from(story.word_count))
            .bind(&story.excerpt)
            .bind(Json(&story.tags))
            .bind(story.published_at.timestamp_micros())
            .bind(story.created_at.timestamp_micros())
            .bind(story.updated_at.timestamp_micros())
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                debug!(id = %story.id, "created story record");
                Ok(story)
            }
            Err(err) if is_unique_violation(&err) => Err(StorageError::Conflict {
                storage_key: story.storage_key,
            }),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> StorageResult<Option<StoryMetadata>> {
        self.fetch(id).await
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: Uuid, patch: StoryPatch) -> StorageResult<Option<StoryMetadata>> {
        let Some(mut story) = self.fetch(id).await? else {
            return Ok(None);
        };
        patch.apply(&mut story, Utc::now());

        // Only the patched columns are written, so concurrent patches of
        // different fields do not clobber each other.
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE stories SET updated_at = ");
        builder.push_bind(story.updated_at.timestamp_micros());
        if patch.title.is_some() {
            builder.push(", title = ");
            builder.push_bind(story.title.clone());
        }
        if patch.author_name.is_some() {
            builder.push(", author_name = ");
            builder.push_bind(story.author_name.clone());
        }
        if patch.word_count.is_some() {
            builder.push(", word_count = ");
            builder.push_bind(i64::from(story.word_count));
        }
        if patch.excerpt.is_some() {
            builder.push(", excerpt = ");
            builder.push_bind(story.excerpt.clone());
        }
        if patch.tags.is_some() {
            builder.push(", tags = ");
            builder.push_bind(Json(story.tags.clone()));
        }
        if patch.published_at.is_some() {
            builder.push(", published_at = ");
            builder.push_bind(story.published_at.timestamp_micros());
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            // deleted between read and write
            return Ok(None);
        }
        Ok(Some(story))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM stories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn query(&self, options: &StoryQuery) -> StorageResult<Page> {
        let order_by = format!(
            "{col} {dir}, id {dir}",
            col = options.sort_by.column(),
            dir = options.sort_order.sql()
        );
        self.page(
            |b| push_story_filters(b, options),
            &order_by,
            options.offset,
            options.page_size(),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn search(&self, options: &SearchQuery) -> StorageResult<Page> {
        self.page(
            |b| push_search_filters(b, options),
            "published_at DESC, id DESC",
            options.offset,
            options.page_size(),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn count(&self, options: &StoryQuery) -> StorageResult<u64> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM stories WHERE 1 = 1");
        push_story_filters(&mut count, options);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(total.max(0) as u64)
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("sqlite index closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_story(key: &str, word_count: u32) -> NewStory {
        NewStory {
            title: "Digital Ghosts".into(),
            author_did: "did:plc:ada".into(),
            author_name: "Ada".into(),
            storage_key: key.into(),
            word_count,
            excerpt: None,
            tags: vec!["fiction".into()],
            published_at: None,
        }
    }

    #[tokio::test]
    async fn schema_rejects_out_of_range_word_count() {
        let index = SqliteIndex::connect("sqlite::memory:", 1).await.unwrap();
        let err = index.create(new_story("k/short.md", 12)).await.unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)), "{err:?}");
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let index = SqliteIndex::connect("sqlite::memory:", 1).await.unwrap();
        index.run_migrations().await.unwrap();
        index.create(new_story("k/a.md", 990)).await.unwrap();
        assert_eq!(index.count(&StoryQuery::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tag_filter_does_not_match_tag_substrings() {
        let index = SqliteIndex::connect("sqlite::memory:", 1).await.unwrap();
        index.create(new_story("k/a.md", 990)).await.unwrap();
        let fi = index
            .query(&StoryQuery::new().with_tags(["fi"]))
            .await
            .unwrap();
        assert_eq!(fi.total, 0);
        let fiction = index
            .query(&StoryQuery::new().with_tags(["fiction"]))
            .await
            .unwrap();
        assert_eq!(fiction.total, 1);
    }

    #[tokio::test]
    async fn search_escapes_like_wildcards() {
        let index = SqliteIndex::connect("sqlite::memory:", 1).await.unwrap();
        index.create(new_story("k/a.md", 990)).await.unwrap();
        let page = index.search(&SearchQuery::new("%")).await.unwrap();
        assert_eq!(page.total, 0);
        let page = index.search(&SearchQuery::new("l g")).await.unwrap();
        assert_eq!(page.total, 1);
    }
}
