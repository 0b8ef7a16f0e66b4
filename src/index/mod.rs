//! Metadata index: the structured, searchable half of story persistence.
//!
//! ```text
//!                 ┌──────────────────────────┐
//!                 │   MetadataIndex (trait)  │
//!                 └──────────────────────────┘
//!                    ↑          ↑          ↑
//!          ┌─────────┴──┐ ┌─────┴──────┐ ┌─┴──────────┐
//!          │SqliteIndex │ │PostgresIdx │ │ SledIndex  │
//!          │ (embedded) │ │ (server)   │ │ (key-value)│
//!          └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! Every backend honors the same contract: not-found is `Ok(None)` /
//! `Ok(false)`, a duplicate `storage_key` is `StorageError::Conflict`, ties in
//! the sort key are broken by `id` in the same direction, tag filters use
//! exact-element AND semantics, and search is an ASCII case-insensitive
//! substring match on title or excerpt.

mod keyvalue;
mod postgres;
mod scan;
mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::StorageResult;
use crate::models::{NewStory, Page, SearchQuery, StoryMetadata, StoryPatch, StoryQuery};

pub use self::keyvalue::{DEFAULT_NAMESPACE as SLED_NAMESPACE, SledIndex};
pub use self::postgres::{DEFAULT_TABLE as POSTGRES_TABLE, PostgresIndex};
pub use self::sqlite::SqliteIndex;

/// Storage-agnostic story metadata operations.
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Short backend identifier used in logs and readiness reports.
    fn backend_name(&self) -> &'static str;

    /// Persist a new record. The backend assigns the id.
    async fn create(&self, input: NewStory) -> StorageResult<StoryMetadata>;

    async fn get(&self, id: Uuid) -> StorageResult<Option<StoryMetadata>>;

    /// Apply `patch`; `updated_at` always advances. `None` if `id` is unknown.
    async fn update(&self, id: Uuid, patch: StoryPatch) -> StorageResult<Option<StoryMetadata>>;

    /// Hard delete. Returns whether a record was removed.
    async fn delete(&self, id: Uuid) -> StorageResult<bool>;

    async fn query(&self, options: &StoryQuery) -> StorageResult<Page>;

    /// `query` with the author filter fixed to `author_did`.
    async fn list_by_author(&self, author_did: &str, options: &StoryQuery) -> StorageResult<Page> {
        let mut options = options.clone();
        options.author_did = Some(author_did.to_string());
        self.query(&options).await
    }

    async fn search(&self, options: &SearchQuery) -> StorageResult<Page>;

    /// Number of records `query` would match, ignoring pagination.
    async fn count(&self, options: &StoryQuery) -> StorageResult<u64> {
        let mut options = options.clone();
        options.offset = 0;
        options.limit = Some(1);
        Ok(self.query(&options).await?.total)
    }

    /// Cheap round trip proving the backend is reachable.
    async fn ping(&self) -> StorageResult<()>;

    /// Release the pool / flush buffers. The index must not be used afterwards.
    async fn close(&self);
}

/// `%needle%` with LIKE wildcards in the needle escaped by `\`.
pub(crate) fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Split a migration script into statements. `--` comment lines are dropped
/// before splitting, so a `;` inside a comment never ends a statement.
pub(crate) fn migration_statements(sql: &str) -> Vec<String> {
    let code: String = sql
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    code.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("ghost"), "%ghost%");
        assert_eq!(like_pattern("100%"), "%100\\%%");
        assert_eq!(like_pattern("a_b\\c"), "%a\\_b\\\\c%");
    }

    #[test]
    fn migration_statements_skip_comment_only_chunks() {
        let sql = "-- header\nCREATE TABLE a (x INT);\n\n-- trailing comment\n";
        let stmts = migration_statements(sql);
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].ends_with("CREATE TABLE a (x INT)"));
    }

    #[test]
    fn migration_statements_ignore_semicolons_in_comments() {
        let sql = "-- ids are blobs; tags are json\nCREATE TABLE a (x INT);\n  -- b; c\nCREATE INDEX i ON a (x);\n";
        let stmts = migration_statements(sql);
        assert_eq!(stmts, vec!["CREATE TABLE a (x INT)", "CREATE INDEX i ON a (x)"]);
    }

    #[test]
    fn bundled_migrations_split_into_plain_statements() {
        for sql in [
            include_str!("../../migrations/sqlite/0001_init.sql"),
            include_str!("../../migrations/postgres/0001_init.sql"),
        ] {
            for stmt in migration_statements(sql) {
                assert!(stmt.starts_with("CREATE"), "{:?}", stmt);
            }
        }
    }
}
