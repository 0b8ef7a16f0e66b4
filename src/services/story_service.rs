//! StoryService — publishes, reads, revises and removes stories by composing
//! one metadata index with one content store.
//!
//! Input validation (word-count contract, title, tags) happens here, at the
//! boundary; backends only enforce what their schema can express.
//!
//! Content is written before the index record. If the index write fails the
//! blob is left behind as an orphan: it is invisible to every query and only
//! logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backends::Backends;
use crate::errors::{StorageError, StorageResult};
use crate::models::story::{MAX_WORD_COUNT, MIN_WORD_COUNT, present_or_null};
use crate::models::{
    NewStory, Page, SearchQuery, StoryMetadata, StoryPatch, StoryQuery,
};
use crate::store::{DEFAULT_CONTENT_TYPE, PutOptions};

pub const MAX_TITLE_CHARS: usize = 200;
pub const MAX_EXCERPT_CHARS: usize = 280;
pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_CHARS: usize = 32;

/// Request to publish a new story.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PublishStory {
    pub title: String,
    pub author_did: String,
    pub author_name: String,
    pub content: String,
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

/// Changes to an existing story. Absent fields are left alone.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RevisionInput {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    /// `null` clears the excerpt.
    #[serde(default, deserialize_with = "present_or_null")]
    pub excerpt: Option<Option<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// A record together with its text. `content` is `None` when the blob is
/// missing from the content store.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StoryWithContent {
    #[serde(flatten)]
    pub story: StoryMetadata,
    pub content: Option<String>,
}

#[derive(Clone)]
pub struct StoryService {
    backends: Backends,
}

impl StoryService {
    pub fn new(backends: Backends) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    #[instrument(skip(self, input), fields(author = %input.author_did))]
    pub async fn publish(&self, input: PublishStory) -> StorageResult<StoryMetadata> {
        let title = validate_title(&input.title)?;
        let author_did = require_text(&input.author_did, "authorDid")?;
        let author_name = require_text(&input.author_name, "authorName")?;
        let tags = normalize_tags(&input.tags)?;
        let word_count = validate_word_count(&input.content)?;
        let excerpt = match &input.excerpt {
            Some(excerpt) => validate_excerpt(excerpt)?,
            None => derive_excerpt(&input.content),
        };

        let now = Utc::now();
        let storage_key = format!("stories/{}/{}.md", now.format("%Y/%m"), Uuid::new_v4());
        let options = PutOptions::content_type(DEFAULT_CONTENT_TYPE)
            .with_metadata("author-did", author_did.clone());
        self.backends
            .store
            .put(&storage_key, &input.content, options)
            .await?;
        debug!(%storage_key, word_count, "story content stored");

        let new_story = NewStory {
            title,
            author_did,
            author_name,
            storage_key: storage_key.clone(),
            word_count,
            excerpt,
            tags,
            published_at: input.published_at,
        };
        match self.backends.index.create(new_story).await {
            Ok(story) => {
                info!(id = %story.id, %storage_key, "story published");
                Ok(story)
            }
            Err(err) => {
                warn!(%storage_key, error = %err, "index write failed; content blob left orphaned");
                Err(err)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn read(&self, id: Uuid) -> StorageResult<Option<StoryWithContent>> {
        let Some(story) = self.backends.index.get(id).await? else {
            return Ok(None);
        };
        let content = self.backends.store.get(&story.storage_key).await?;
        if content.is_none() {
            warn!(%id, storage_key = %story.storage_key, "story content is missing");
        }
        Ok(Some(StoryWithContent { story, content }))
    }

    /// Apply a revision. New content is rewritten under the existing storage
    /// key and the word count recomputed. `None` if the story does not exist.
    #[instrument(skip(self, input))]
    pub async fn revise(
        &self,
        id: Uuid,
        input: RevisionInput,
    ) -> StorageResult<Option<StoryMetadata>> {
        let mut patch = StoryPatch {
            title: input.title.as_deref().map(validate_title).transpose()?,
            author_name: input
                .author_name
                .as_deref()
                .map(|name| require_text(name, "authorName"))
                .transpose()?,
            tags: input.tags.as_deref().map(normalize_tags).transpose()?,
            ..StoryPatch::default()
        };
        patch.excerpt = match &input.excerpt {
            Some(Some(excerpt)) => Some(validate_excerpt(excerpt)?),
            Some(None) => Some(None),
            None => None,
        };
        if let Some(content) = &input.content {
            patch.word_count = Some(validate_word_count(content)?);
        }

        let Some(existing) = self.backends.index.get(id).await? else {
            return Ok(None);
        };
        if let Some(content) = &input.content {
            let options = PutOptions::content_type(DEFAULT_CONTENT_TYPE)
                .with_metadata("author-did", existing.author_did.clone());
            self.backends
                .store
                .put(&existing.storage_key, content, options)
                .await?;
            debug!(storage_key = %existing.storage_key, "story content rewritten");
        }

        let updated = self.backends.index.update(id, patch).await?;
        if updated.is_none() {
            warn!(%id, "story disappeared while being revised");
        }
        Ok(updated)
    }

    /// Delete the record, then its content. Returns whether a story existed.
    ///
    /// A content-store failure is returned after the record is gone; the
    /// story is no longer visible and the blob is left as an orphan.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: Uuid) -> StorageResult<bool> {
        let Some(story) = self.backends.index.get(id).await? else {
            return Ok(false);
        };
        if !self.backends.index.delete(id).await? {
            return Ok(false);
        }
        match self.backends.store.delete(&story.storage_key).await {
            Ok(true) => debug!(storage_key = %story.storage_key, "story content removed"),
            Ok(false) => warn!(storage_key = %story.storage_key, "story content was already gone"),
            Err(err) => {
                warn!(
                    %id,
                    storage_key = %story.storage_key,
                    error = %err,
                    "story record removed but its content could not be deleted"
                );
                return Err(err);
            }
        }
        info!(%id, "story removed");
        Ok(true)
    }

    pub async fn list(&self, query: &StoryQuery) -> StorageResult<Page> {
        self.backends.index.query(query).await
    }

    pub async fn list_by_author(&self, author_did: &str, query: &StoryQuery) -> StorageResult<Page> {
        self.backends.index.list_by_author(author_did, query).await
    }

    pub async fn search(&self, query: &SearchQuery) -> StorageResult<Page> {
        self.backends.index.search(query).await
    }

    pub async fn count(&self, query: &StoryQuery) -> StorageResult<u64> {
        self.backends.index.count(query).await
    }
}

/// Whitespace-separated tokens.
pub fn count_words(content: &str) -> usize {
    content.split_whitespace().count()
}

fn validate_word_count(content: &str) -> StorageResult<u32> {
    let words = count_words(content);
    let in_range = (MIN_WORD_COUNT as usize..=MAX_WORD_COUNT as usize).contains(&words);
    if !in_range {
        return Err(StorageError::validation(format!(
            "story must have between {} and {} words, got {}",
            MIN_WORD_COUNT, MAX_WORD_COUNT, words
        )));
    }
    Ok(words as u32)
}

fn require_text(value: &str, field: &str) -> StorageResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(StorageError::validation(format!("{} must not be empty", field)));
    }
    Ok(value.to_string())
}

fn validate_title(title: &str) -> StorageResult<String> {
    let title = require_text(title, "title")?;
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(StorageError::validation(format!(
            "title must be at most {} characters",
            MAX_TITLE_CHARS
        )));
    }
    Ok(title)
}

/// Blank excerpts are treated as no excerpt.
fn validate_excerpt(excerpt: &str) -> StorageResult<Option<String>> {
    let excerpt = excerpt.trim();
    if excerpt.chars().count() > MAX_EXCERPT_CHARS {
        return Err(StorageError::validation(format!(
            "excerpt must be at most {} characters",
            MAX_EXCERPT_CHARS
        )));
    }
    Ok((!excerpt.is_empty()).then(|| excerpt.to_string()))
}

/// Trimmed, lower-cased and deduplicated, keeping first-seen order.
fn normalize_tags(tags: &[String]) -> StorageResult<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() || normalized.contains(&tag) {
            continue;
        }
        if tag.chars().count() > MAX_TAG_CHARS {
            return Err(StorageError::validation(format!(
                "tag `{}` is longer than {} characters",
                tag, MAX_TAG_CHARS
            )));
        }
        normalized.push(tag);
    }
    if normalized.len() > MAX_TAGS {
        return Err(StorageError::validation(format!(
            "at most {} tags are allowed",
            MAX_TAGS
        )));
    }
    Ok(normalized)
}

/// Leading words of the content, cut at a word boundary.
fn derive_excerpt(content: &str) -> Option<String> {
    let mut excerpt = String::new();
    let mut chars = 0;
    for word in content.split_whitespace() {
        let needed = word.chars().count() + usize::from(!excerpt.is_empty());
        if chars + needed > MAX_EXCERPT_CHARS {
            break;
        }
        if !excerpt.is_empty() {
            excerpt.push(' ');
        }
        excerpt.push_str(word);
        chars += needed;
    }
    (!excerpt.is_empty()).then_some(excerpt)
}
