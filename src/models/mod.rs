//! Core data models for the story index and content store.
//!
//! `StoryMetadata` is the record owned by the metadata index; the content
//! store only ever reports derived `StoryFileMetadata`. Query types are
//! backend-neutral and carry the logical sort field names.

pub mod query;
pub mod story;

pub use query::{Page, SearchQuery, SortField, SortOrder, StoryQuery};
pub use story::{NewStory, StoryFileMetadata, StoryMetadata, StoryPatch};
