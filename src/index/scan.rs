//! In-memory evaluation of index queries.
//!
//! Backends without native secondary filtering or text search load candidate
//! records and run them through these predicates. The ordering rules mirror
//! the SQL backends exactly: bytewise title order, microsecond timestamps,
//! `id` as tie-break in the sort direction.

use std::cmp::Ordering;

use crate::models::{Page, SearchQuery, SortField, SortOrder, StoryMetadata, StoryQuery};

pub(crate) fn compare(
    a: &StoryMetadata,
    b: &StoryMetadata,
    sort_by: SortField,
    sort_order: SortOrder,
) -> Ordering {
    let primary = match sort_by {
        SortField::PublishedAt => a.published_at.cmp(&b.published_at),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::Title => a.title.as_bytes().cmp(b.title.as_bytes()),
    };
    let ordering = primary.then_with(|| a.id.as_bytes().cmp(b.id.as_bytes()));
    match sort_order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

pub(crate) fn matches_query(story: &StoryMetadata, options: &StoryQuery) -> bool {
    options
        .author_did
        .as_deref()
        .is_none_or(|did| story.author_did == did)
        && story.has_all_tags(&options.tags)
}

/// `needle` must already be folded with `SearchQuery::needle`.
pub(crate) fn matches_search(story: &StoryMetadata, needle: &str, options: &SearchQuery) -> bool {
    if let Some(did) = options.author_did.as_deref() {
        if story.author_did != did {
            return false;
        }
    }
    story.title.to_ascii_lowercase().contains(needle)
        || story
            .excerpt
            .as_deref()
            .is_some_and(|e| e.to_ascii_lowercase().contains(needle))
}

/// Sort the full match set and cut out one page. `total` is exact.
pub(crate) fn paginate(
    mut matches: Vec<StoryMetadata>,
    sort_by: SortField,
    sort_order: SortOrder,
    offset: usize,
    limit: usize,
) -> Page {
    matches.sort_by(|a, b| compare(a, b, sort_by, sort_order));
    let total = matches.len() as u64;
    let stories: Vec<StoryMetadata> = matches.into_iter().skip(offset).take(limit).collect();
    Page::new(stories, total, offset)
}
