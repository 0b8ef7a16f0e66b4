//! SledIndex — key-value metadata index with a wide-column style layout.
//!
//! ```text
//! {ns}.stories       id (16 bytes)                          → JSON record
//! {ns}.storage_keys  storage_key                            → id
//! {ns}.by_author     author_did 0x00 published_at(be) id    → ()
//! ```
//!
//! `stories` is the primary partition. `storage_keys` stands in for a unique
//! constraint: create checks and claims the key inside the same transaction
//! that writes the record, so concurrent creates with one key serialize and
//! the loser sees `Conflict`. `by_author` is the secondary access pattern,
//! sorted by publication time within an author partition.
//!
//! There is no native text search or multi-attribute filtering. Search, tag
//! filters and unscoped listings scan the whole `stories` tree and evaluate
//! predicates in memory; cost grows linearly with the number of stories.
//! Scans run on tokio's blocking pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{
    IVec, Transactional, Tree,
    transaction::{ConflictableTransactionError, TransactionError},
};
use std::path::Path;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::MetadataIndex;
use super::scan;
use crate::errors::{StorageError, StorageResult};
use crate::models::{
    NewStory, Page, SearchQuery, SortField, SortOrder, StoryMetadata, StoryPatch, StoryQuery,
};

pub const DEFAULT_NAMESPACE: &str = "stories";

#[derive(Clone, Debug)]
pub struct SledIndex {
    db: sled::Db,
    stories: Tree,
    storage_keys: Tree,
    by_author: Tree,
}

impl SledIndex {
    /// Open (or create) the database directory at `path`. `namespace`
    /// prefixes every tree so several indexes can share one database.
    pub fn open(path: impl AsRef<Path>, namespace: &str) -> StorageResult<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), namespace, "sled index opened");
        Self::with_db(db, namespace)
    }

    /// A throwaway database removed when the last handle drops.
    pub fn temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, DEFAULT_NAMESPACE)
    }

    fn with_db(db: sled::Db, namespace: &str) -> StorageResult<Self> {
        if namespace.is_empty() {
            return Err(StorageError::Config("sled namespace must not be empty".into()));
        }
        let stories = db.open_tree(format!("{namespace}.stories"))?;
        let storage_keys = db.open_tree(format!("{namespace}.storage_keys"))?;
        let by_author = db.open_tree(format!("{namespace}.by_author"))?;
        Ok(Self {
            db,
            stories,
            storage_keys,
            by_author,
        })
    }

    fn load(&self, id: &Uuid) -> StorageResult<Option<StoryMetadata>> {
        self.stories
            .get(id.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    /// `candidates` on the blocking pool; full scans decode every record.
    async fn scan_candidates(&self, author_did: Option<&str>) -> StorageResult<Vec<StoryMetadata>> {
        let index = self.clone();
        let author_did = author_did.map(str::to_owned);
        tokio::task::spawn_blocking(move || index.candidates(author_did.as_deref()))
            .await
            .map_err(|err| StorageError::unavailable("sled", err))?
    }

    /// Every record that could satisfy a filter on `author_did`. With an
    /// author the secondary partition is used; otherwise the full table.
    fn candidates(&self, author_did: Option<&str>) -> StorageResult<Vec<StoryMetadata>> {
        let mut out = Vec::new();
        match author_did {
            Some(did) => {
                for entry in self.by_author.scan_prefix(author_prefix(did)) {
                    let (key, _) = entry?;
                    let id = id_from_author_key(&key)?;
                    // Entry may outlive its record briefly under concurrent deletes.
                    if let Some(story) = self.load(&id)? {
                        out.push(story);
                    }
                }
            }
            None => {
                for entry in self.stories.iter() {
                    let (_, raw) = entry?;
                    out.push(decode(&raw)?);
                }
            }
        }
        debug!(count = out.len(), "scanned candidate stories");
        Ok(out)
    }
}

fn decode(raw: &[u8]) -> StorageResult<StoryMetadata> {
    Ok(serde_json::from_slice(raw)?)
}

/// Signed micros mapped onto an unsigned big-endian key that sorts in time order.
fn sortable_micros(ts: DateTime<Utc>) -> [u8; 8] {
    ((ts.timestamp_micros() as u64) ^ (1 << 63)).to_be_bytes()
}

fn author_prefix(author_did: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(author_did.len() + 1);
    key.extend_from_slice(author_did.as_bytes());
    key.push(0);
    key
}

fn author_key(story: &StoryMetadata) -> Vec<u8> {
    let mut key = author_prefix(&story.author_did);
    key.extend_from_slice(&sortable_micros(story.published_at));
    key.extend_from_slice(story.id.as_bytes());
    key
}

fn id_from_author_key(key: &[u8]) -> StorageResult<Uuid> {
    key.len()
        .checked_sub(16)
        .and_then(|start| Uuid::from_slice(&key[start..]).ok())
        .ok_or_else(|| StorageError::Corrupt("malformed author index entry".into()))
}

fn abort<E: Into<StorageError>>(err: E) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(err.into())
}

#[async_trait]
impl MetadataIndex for SledIndex {
    fn backend_name(&self) -> &'static str {
        "sled"
    }

    #[instrument(skip(self, input), fields(storage_key = %input.storage_key))]
    async fn create(&self, input: NewStory) -> StorageResult<StoryMetadata> {
        let story = input.into_metadata(Uuid::new_v4(), Utc::now());
        let record = serde_json::to_vec(&story)?;
        let id_key = story.id.as_bytes().to_vec();
        let index_key = author_key(&story);
        let storage_key = story.storage_key.as_bytes();

        let outcome = (&self.stories, &self.storage_keys, &self.by_author).transaction(
            |(stories, keys, by_author)| {
                if keys.get(storage_key)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(()));
                }
                keys.insert(storage_key, id_key.as_slice())?;
                stories.insert(id_key.as_slice(), record.as_slice())?;
                by_author.insert(index_key.as_slice(), IVec::default())?;
                Ok(())
            },
        );

        match outcome {
            Ok(()) => {
                debug!(id = %story.id, "created story record");
                Ok(story)
            }
            Err(TransactionError::Abort(())) => Err(StorageError::Conflict {
                storage_key: story.storage_key,
            }),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> StorageResult<Option<StoryMetadata>> {
        self.load(&id)
    }

    #[instrument(skip(self, patch))]
    async fn update(&self, id: Uuid, patch: StoryPatch) -> StorageResult<Option<StoryMetadata>> {
        let now = Utc::now();
        let id_key = id.as_bytes().to_vec();

        let outcome = (&self.stories, &self.by_author).transaction(|(stories, by_author)| {
            let Some(raw) = stories.get(id_key.as_slice())? else {
                return Ok(None);
            };
            let mut story = decode(&raw).map_err(abort)?;
            let old_index_key = author_key(&story);
            patch.apply(&mut story, now);

            let record = serde_json::to_vec(&story).map_err(abort)?;
            stories.insert(id_key.as_slice(), record)?;
            let new_index_key = author_key(&story);
            if new_index_key != old_index_key {
                by_author.remove(old_index_key)?;
                by_author.insert(new_index_key, IVec::default())?;
            }
            Ok(Some(story))
        });

        match outcome {
            Ok(story) => Ok(story),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> StorageResult<bool> {
        let id_key = id.as_bytes().to_vec();

        let outcome = (&self.stories, &self.storage_keys, &self.by_author).transaction(
            |(stories, keys, by_author)| {
                let Some(raw) = stories.remove(id_key.as_slice())? else {
                    return Ok(false);
                };
                let story = decode(&raw).map_err(abort)?;
                keys.remove(story.storage_key.as_bytes())?;
                by_author.remove(author_key(&story))?;
                Ok(true)
            },
        );

        match outcome {
            Ok(removed) => Ok(removed),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    #[instrument(skip(self))]
    async fn query(&self, options: &StoryQuery) -> StorageResult<Page> {
        let matches: Vec<StoryMetadata> = self
            .scan_candidates(options.author_did.as_deref())
            .await?
            .into_iter()
            .filter(|story| scan::matches_query(story, options))
            .collect();
        Ok(scan::paginate(
            matches,
            options.sort_by,
            options.sort_order,
            options.offset,
            options.page_size(),
        ))
    }

    #[instrument(skip(self))]
    async fn search(&self, options: &SearchQuery) -> StorageResult<Page> {
        let needle = options.needle();
        let matches: Vec<StoryMetadata> = self
            .scan_candidates(options.author_did.as_deref())
            .await?
            .into_iter()
            .filter(|story| scan::matches_search(story, &needle, options))
            .collect();
        Ok(scan::paginate(
            matches,
            SortField::PublishedAt,
            SortOrder::Desc,
            options.offset,
            options.page_size(),
        ))
    }

    #[instrument(skip(self))]
    async fn count(&self, options: &StoryQuery) -> StorageResult<u64> {
        if options.author_did.is_none() && options.tags.is_empty() {
            return Ok(self.stories.len() as u64);
        }
        let total = self
            .scan_candidates(options.author_did.as_deref())
            .await?
            .iter()
            .filter(|story| scan::matches_query(story, options))
            .count();
        Ok(total as u64)
    }

    async fn ping(&self) -> StorageResult<()> {
        self.stories.first()?;
        Ok(())
    }

    async fn close(&self) {
        match self.db.flush_async().await {
            Ok(bytes) => info!(bytes, "sled index flushed"),
            Err(err) => warn!("failed to flush sled index: {}", err),
        }
    }
}
