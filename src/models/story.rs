//! Represents a published story record and the blob attributes behind it.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lower bound of the word-count contract, inclusive.
pub const MIN_WORD_COUNT: u32 = 950;
/// Upper bound of the word-count contract, inclusive.
pub const MAX_WORD_COUNT: u32 = 1000;

/// Searchable description of a single story.
///
/// The record lives in the metadata index; the text itself is a blob in the
/// content store addressed by `storage_key`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryMetadata {
    /// Assigned by the index at creation time, never changes.
    pub id: Uuid,

    /// Display title, never empty.
    pub title: String,

    /// Opaque author identifier from the identity provider.
    pub author_did: String,

    /// Snapshot of the author's display name at creation/update time.
    pub author_name: String,

    /// Key of the content blob. Unique across all records.
    pub storage_key: String,

    /// Number of words in the content.
    pub word_count: u32,

    /// Optional short snippet shown in listings.
    pub excerpt: Option<String>,

    /// Short labels; matching is exact-element, order is irrelevant.
    #[serde(default)]
    pub tags: Vec<String>,

    pub published_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl StoryMetadata {
    /// True if every tag in `wanted` is present on this record.
    pub fn has_all_tags(&self, wanted: &[String]) -> bool {
        wanted.iter().all(|tag| self.tags.iter().any(|t| t == tag))
    }
}

/// Input for `MetadataIndex::create`. The index assigns `id` and timestamps
/// unless `published_at` is given explicitly.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NewStory {
    pub title: String,
    pub author_did: String,
    pub author_name: String,
    pub storage_key: String,
    pub word_count: u32,
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl NewStory {
    /// Materialize the record a backend persists for this input.
    pub fn into_metadata(self, id: Uuid, now: DateTime<Utc>) -> StoryMetadata {
        let now = truncate_micros(now);
        StoryMetadata {
            id,
            title: self.title,
            author_did: self.author_did,
            author_name: self.author_name,
            storage_key: self.storage_key,
            word_count: self.word_count,
            excerpt: self.excerpt,
            tags: self.tags,
            published_at: self.published_at.map(truncate_micros).unwrap_or(now),
            updated_at: now,
            created_at: now,
        }
    }
}

/// Partial update. Only fields that are `Some` change; `id`, `author_did`,
/// `storage_key` and `created_at` are not representable here.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StoryPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub word_count: Option<u32>,
    /// `Some(None)` clears the excerpt.
    #[serde(default, deserialize_with = "present_or_null")]
    pub excerpt: Option<Option<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl StoryPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Apply the patch and advance `updated_at`, even if no field changed.
    pub fn apply(&self, story: &mut StoryMetadata, now: DateTime<Utc>) {
        if let Some(title) = &self.title {
            story.title = title.clone();
        }
        if let Some(author_name) = &self.author_name {
            story.author_name = author_name.clone();
        }
        if let Some(word_count) = self.word_count {
            story.word_count = word_count;
        }
        if let Some(excerpt) = &self.excerpt {
            story.excerpt = excerpt.clone();
        }
        if let Some(tags) = &self.tags {
            story.tags = tags.clone();
        }
        if let Some(published_at) = self.published_at {
            story.published_at = truncate_micros(published_at);
        }
        story.updated_at = next_updated_at(story.updated_at, now);
    }
}

/// Distinguishes an explicit `null` (clear) from an absent field (keep).
pub(crate) fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Blob attributes reported by a content store, computed on demand.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryFileMetadata {
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub last_modified: DateTime<Utc>,
    pub etag: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Timestamps are kept at microsecond precision so every backend round-trips
/// them exactly.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// `updated_at` strictly advances, even when the clock has not.
pub fn next_updated_at(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = truncate_micros(now);
    let floor = previous + chrono::Duration::microseconds(1);
    if now > previous { now } else { floor }
}
