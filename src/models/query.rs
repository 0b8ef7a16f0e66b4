//! Backend-neutral listing and search options.
//!
//! Field names here are logical; every backend maps them to its own columns
//! or attributes internally.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use super::story::StoryMetadata;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Sortable story attributes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    PublishedAt,
    UpdatedAt,
    CreatedAt,
    Title,
}

impl SortField {
    /// Column name used by the SQL backends.
    pub fn column(self) -> &'static str {
        match self {
            SortField::PublishedAt => "published_at",
            SortField::UpdatedAt => "updated_at",
            SortField::CreatedAt => "created_at",
            SortField::Title => "title",
        }
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publishedAt" => Ok(SortField::PublishedAt),
            "updatedAt" => Ok(SortField::UpdatedAt),
            "createdAt" => Ok(SortField::CreatedAt),
            "title" => Ok(SortField::Title),
            other => Err(format!("unknown sort field `{}`", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn sql(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order `{}`", other)),
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// Options for `MetadataIndex::query`.
///
/// Defaults: no filters, `publishedAt` descending, offset 0, 20 per page.
#[derive(Clone, Debug, Default)]
pub struct StoryQuery {
    /// Exact match on `author_did`.
    pub author_did: Option<String>,
    /// Record must carry every tag listed here.
    pub tags: Vec<String>,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl StoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_author(mut self, author_did: impl Into<String>) -> Self {
        self.author_did = Some(author_did.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn sorted(mut self, sort_by: SortField, sort_order: SortOrder) -> Self {
        self.sort_by = sort_by;
        self.sort_order = sort_order;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Effective page size, clamped to `1..=MAX_PAGE_SIZE`.
    pub fn page_size(&self) -> usize {
        effective_limit(self.limit)
    }
}

/// Options for `MetadataIndex::search`. Results are always ordered by
/// `publishedAt` descending.
#[derive(Clone, Debug, Default)]
pub struct SearchQuery {
    /// Case-insensitive substring matched against title or excerpt.
    pub query: String,
    pub author_did: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn by_author(mut self, author_did: impl Into<String>) -> Self {
        self.author_did = Some(author_did.into());
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn page_size(&self) -> usize {
        effective_limit(self.limit)
    }

    /// The needle in its folded form. Only ASCII letters are folded, which
    /// every backend can reproduce natively.
    pub fn needle(&self) -> String {
        self.query.to_ascii_lowercase()
    }
}

fn effective_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// One page of results plus the total number of matches.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub stories: Vec<StoryMetadata>,
    pub total: u64,
    pub has_more: bool,
}

impl Page {
    pub fn new(stories: Vec<StoryMetadata>, total: u64, offset: usize) -> Self {
        let has_more = (offset.saturating_add(stories.len()) as u64) < total;
        Self {
            stories,
            total,
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_sort_newest_first_twenty_per_page() {
        let q = StoryQuery::new();
        assert_eq!(q.sort_by, SortField::PublishedAt);
        assert_eq!(q.sort_order, SortOrder::Desc);
        assert_eq!(q.page_size(), 20);
    }

    #[test]
    fn page_size_is_clamped() {
        assert_eq!(StoryQuery::new().page(0, 0).page_size(), 1);
        assert_eq!(StoryQuery::new().page(0, 5000).page_size(), MAX_PAGE_SIZE);
    }

    #[test]
    fn sort_names_parse_from_logical_names() {
        assert_eq!("title".parse::<SortField>().unwrap(), SortField::Title);
        assert_eq!("ASC".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert!("published_at".parse::<SortField>().is_err());
    }

    #[test]
    fn has_more_reflects_remaining_records() {
        assert!(!Page::new(Vec::new(), 0, 0).has_more);
        assert!(!Page::new(Vec::new(), 3, 5).has_more);
        let page = Page::new(Vec::new(), 3, 2);
        assert!(page.has_more);
    }
}
