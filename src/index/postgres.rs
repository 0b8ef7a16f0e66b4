//! PostgresIndex — relational SQL metadata index.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS stories (
//!     id           UUID PRIMARY KEY,
//!     storage_key  TEXT NOT NULL UNIQUE,
//!     tags         TEXT[] NOT NULL DEFAULT '{}',
//!     published_at TIMESTAMPTZ NOT NULL,
//!     ...
//! );
//! ```
//!
//! The table name is configurable so several indexes can share a database.
//! Tag filters use array containment (`@>`), which is exact-element
//! membership. Text comparisons go through `COLLATE "C"` so ordering is
//! bytewise and `lower()` folds ASCII only, the same as the other backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, Postgres, QueryBuilder,
    postgres::{PgPool, PgPoolOptions},
};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{MetadataIndex, is_unique_violation, like_pattern, migration_statements};
use crate::errors::{StorageError, StorageResult};
use crate::models::{
    NewStory, Page, SearchQuery, SortField, StoryMetadata, StoryPatch, StoryQuery,
};

const MIGRATION: &str = include_str!("../../migrations/postgres/0001_init.sql");

pub const DEFAULT_TABLE: &str = "stories";

const STORY_COLUMNS: &str = "id, title, author_did, author_name, storage_key, word_count, \
     excerpt, tags, published_at, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct PostgresIndex {
    pool: PgPool,
    table: String,
}

#[derive(FromRow)]
struct StoryRow {
    id: Uuid,
    title: String,
    author_did: String,
    author_name: String,
    storage_key: String,
    word_count: i32,
    excerpt: Option<String>,
    tags: Vec<String>,
    published_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
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
            tags: row.tags,
            published_at: row.published_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn ensure_table_name_safe(table: &str) -> StorageResult<()> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if valid_start
        && table.len() <= 48
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        Ok(())
    } else {
        Err(StorageError::Config(format!(
            "table name `{}` must be a lowercase identifier",
            table
        )))
    }
}

impl PostgresIndex {
    /// Connect, then create the table and its indexes if they are missing.
    pub async fn connect(
        connection_string: &str,
        max_connections: u32,
        table: &str,
    ) -> StorageResult<Self> {
        if !(connection_string.starts_with("postgres://")
            || connection_string.starts_with("postgresql://"))
        {
            return Err(StorageError::Config(
                "connection string must be a postgres:// URL".into(),
            ));
        }
        ensure_table_name_safe(table)?;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(connection_string)
            .await
            .map_err(|e| StorageError::unavailable("postgres", format!("failed to connect: {e}")))?;

        let index = Self {
            pool,
            table: table.to_string(),
        };
        index.run_migrations().await?;
        info!(table = %index.table, "postgres index ready");
        Ok(index)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        let sql = MIGRATION.replace("stories", &self.table);
        let statements = migration_statements(&sql);
        debug!("Running {} postgres migration statements...", statements.len());
        for stmt in statements {
            sqlx::query(&stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Remove every record. Used to reset shared test databases.
    pub async fn truncate(&self) -> StorageResult<()> {
        sqlx::query(&format!("TRUNCATE TABLE {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> StorageResult<Option<StoryMetadata>> {
        let sql = format!("SELECT {} FROM {} WHERE id = $1", STORY_COLUMNS, self.table);
        sqlx::query_as::<_, StoryRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(StoryMetadata::try_from)
            .transpose()
    }

    async fn page(
        &self,
        filters: impl Fn(&mut QueryBuilder<'static, Postgres>),
        order_by: &str,
        offset: usize,
        limit: usize,
    ) -> StorageResult<Page> {
        let mut count = QueryBuilder::<Postgres>::new(format!(
            "SELECT COUNT(*) FROM {} WHERE TRUE",
            self.table
        ));
        filters(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM {} WHERE TRUE",
            STORY_COLUMNS, self.table
        ));
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

fn sort_expression(field: SortField) -> &'static str {
    match field {
        SortField::Title => r#"title COLLATE "C""#,
        other => other.column(),
    }
}

fn push_story_filters(builder: &mut QueryBuilder<'static, Postgres>, options: &StoryQuery) {
    if let Some(did) = &options.author_did {
        builder.push(" AND author_did = ");
        builder.push_bind(did.clone());
    }
    if !options.tags.is_empty() {
        builder.push(" AND tags @> ");
        builder.push_bind(options.tags.clone());
    }
}

fn push_search_filters(builder: &mut QueryBuilder<'static, Postgres>, options: &SearchQuery) {
    let pattern = like_pattern(&options.needle());
    builder.push(r#" AND (lower(title COLLATE "C") LIKE "#);
    builder.push_bind(pattern.clone());
    builder.push(r#" ESCAPE '\' OR lower(COALESCE(excerpt, '') COLLATE "C") LIKE "#);
    builder.push_bind(pattern);
    builder.push(r" ESCAPE '\')");
    if let Some(did) = &options.author_did {
        builder.push(" AND author_did = ");
        builder.push_bind(did.clone());
    }
}

#[async_trait]
impl MetadataIndex for PostgresIndex {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, input), fields(storage_key = %input.storage_key))]
    async fn create(&self, input: NewStory) -> StorageResult<StoryMetadata> {
        let story = input.into_metadata(Uuid::new_v4(), Utc::now());
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            self.table, STORY_COLUMNS
        );
        let word_count = i32::try_from(story.word_count)
            .map_err(|_| StorageError::validation("word count out of range"))?;
        let result = sqlx::query(&sql)
            .bind(story.id)
            .bind(&story.title)
            .bind(&story.author_did)
            .bind(&story.author_name)
            .bind(&story.storage_key)
            .bind(word_count)
            .bind(&story.excerpt)
            .bind(&story.tags)
            .bind(story.published_at)
            .bind(story.created_at)
            .bind(story.updated_at)
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

        let mut builder =
            QueryBuilder::<Postgres>::new(format!("UPDATE {} SET updated_at = ", self.table));
        builder.push_bind(story.updated_at);
        if patch.title.is_some() {
            builder.push(", title = ");
            builder.push_bind(story.title.clone());
        }
        if patch.author_name.is_some() {
            builder.push(", author_name = ");
            builder.push_bind(story.author_name.clone());
        }
        if patch.word_count.is_some() {
            let word_count = i32::try_from(story.word_count)
                .map_err(|_| StorageError::validation("word count out of range"))?;
            builder.push(", word_count = ");
            builder.push_bind(word_count);
        }
        if patch.excerpt.is_some() {
            builder.push(", excerpt = ");
            builder.push_bind(story.excerpt.clone());
        }
        if patch.tags.is_some() {
            builder.push(", tags = ");
            builder.push_bind(story.tags.clone());
        }
        if patch.published_at.is_some() {
            builder.push(", published_at = ");
            builder.push_bind(story.published_at);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(story))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn query(&self, options: &StoryQuery) -> StorageResult<Page> {
        let order_by = format!(
            "{col} {dir}, id {dir}",
            col = sort_expression(options.sort_by),
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
        let mut count = QueryBuilder::<Postgres>::new(format!(
            "SELECT COUNT(*) FROM {} WHERE TRUE",
            self.table
        ));
        push_story_filters(&mut count, options);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(total.max(0) as u64)
    }

    async fn ping(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("postgres index closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_must_be_plain_identifiers() {
        assert!(ensure_table_name_safe("stories").is_ok());
        assert!(ensure_table_name_safe("_test_stories_2").is_ok());
        assert!(ensure_table_name_safe("").is_err());
        assert!(ensure_table_name_safe("9lives").is_err());
        assert!(ensure_table_name_safe("stories; DROP TABLE x").is_err());
        assert!(ensure_table_name_safe("Stories").is_err());
    }

    #[test]
    fn title_sort_is_bytewise() {
        assert_eq!(sort_expression(SortField::Title), r#"title COLLATE "C""#);
        assert_eq!(sort_expression(SortField::PublishedAt), "published_at");
    }

    #[test]
    fn migration_is_rewritten_for_custom_tables() {
        let sql = MIGRATION.replace("stories", "shelf_a");
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS shelf_a"));
        assert!(sql.contains("idx_shelf_a_tags ON shelf_a"));
        assert!(!sql.contains("stories"));
    }

    #[tokio::test]
    async fn rejects_non_postgres_urls_before_connecting() {
        let err = PostgresIndex::connect("mysql://localhost/db", 1, DEFAULT_TABLE)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
