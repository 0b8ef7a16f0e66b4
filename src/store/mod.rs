//! Content store: raw story text addressed by caller-chosen keys.
//!
//! The store knows nothing about metadata. Keys are the index's
//! `storage_key`; a blob nobody indexes is simply invisible.
//!
//! Listing is token based. Each backend mints its own opaque continuation
//! token; callers hand it back unchanged and never assume numeric offsets.

mod filesystem;
mod object;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use std::collections::HashMap;

use crate::errors::{StorageError, StorageResult};
use crate::models::StoryFileMetadata;

pub use self::filesystem::FilesystemStore;
pub use self::object::{ObjectContentStore, S3Config};

pub const DEFAULT_CONTENT_TYPE: &str = "text/markdown; charset=utf-8";
pub const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

const MAX_KEY_LEN: usize = 1024;

/// Hints stored alongside a blob.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl PutOptions {
    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Plain string prefix on the key.
    pub prefix: Option<String>,
    /// Page size cap, clamped to `1..=DEFAULT_LIST_PAGE_SIZE`.
    pub max_keys: Option<usize>,
    /// Token returned by the previous page of the same backend.
    pub continuation_token: Option<String>,
}

impl ListOptions {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = Some(max_keys);
        self
    }

    pub fn after(mut self, token: Option<String>) -> Self {
        self.continuation_token = token;
        self
    }

    pub(crate) fn page_size(&self) -> usize {
        self.max_keys
            .unwrap_or(DEFAULT_LIST_PAGE_SIZE)
            .clamp(1, DEFAULT_LIST_PAGE_SIZE)
    }
}

#[derive(Clone, Debug)]
pub struct ListResult {
    /// Ordered by key, ascending.
    pub files: Vec<StoryFileMetadata>,
    pub continuation_token: Option<String>,
    pub has_more: bool,
}

/// Blob storage for story text.
#[async_trait]
pub trait ContentStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Full content, or `None` if no blob exists under `key`.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Write unconditionally, replacing any previous blob.
    async fn put(&self, key: &str, content: &str, options: PutOptions) -> StorageResult<()>;

    /// Returns whether a blob was removed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    async fn list(&self, options: ListOptions) -> StorageResult<ListResult>;

    /// Existence check without reading content.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Size, content type, modification time and etag without the content.
    async fn get_metadata(&self, key: &str) -> StorageResult<Option<StoryFileMetadata>>;

    /// Release held resources. Default: nothing to release.
    async fn close(&self) {}
}

/// Basic key validation to avoid trivial path traversal vectors.
///
/// Rejects empty or oversized keys, keys that begin with `/`, contain `..`,
/// `.` segments, backslashes or control characters.
pub(crate) fn ensure_key_safe(key: &str) -> StorageResult<()> {
    let reason = if key.is_empty() {
        "empty"
    } else if key.len() > MAX_KEY_LEN {
        "longer than 1024 bytes"
    } else if key.starts_with('/')
        || key.ends_with('/')
        || key.contains("..")
        || key.contains("//")
        || key.split('/').any(|segment| segment == ".")
    {
        "malformed path"
    } else if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
        "control character or backslash"
    } else {
        return Ok(());
    };
    Err(StorageError::validation(format!("invalid key `{}`: {}", key, reason)))
}

/// Tokens carry the issuing backend's scope and the last key returned; the
/// next page resumes strictly after that key. A token minted by one backend
/// is rejected by another.
pub(crate) fn encode_continuation_token(scope: &str, last_key: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(format!("{}\n{}", scope, last_key))
}

pub(crate) fn decode_continuation_token(scope: &str, token: &str) -> StorageResult<String> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|raw| {
            raw.split_once('\n')
                .filter(|(issuer, _)| *issuer == scope)
                .map(|(_, key)| key.to_string())
        })
        .ok_or_else(|| StorageError::validation("malformed continuation token"))
}

/// Wrap up a page built from up to `page_size + 1` probed entries.
pub(crate) fn finish_page(
    scope: &str,
    mut files: Vec<StoryFileMetadata>,
    page_size: usize,
) -> ListResult {
    let has_more = files.len() > page_size;
    files.truncate(page_size);
    let continuation_token = if has_more {
        files.last().map(|f| encode_continuation_token(scope, &f.key))
    } else {
        None
    };
    ListResult {
        files,
        continuation_token,
        has_more,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation_rejects_traversal() {
        assert!(ensure_key_safe("stories/2024/01/a.md").is_ok());
        assert!(ensure_key_safe("").is_err());
        assert!(ensure_key_safe("/etc/passwd").is_err());
        assert!(ensure_key_safe("stories/../../etc").is_err());
        assert!(ensure_key_safe("a\\b").is_err());
        assert!(ensure_key_safe("a\nb").is_err());
        assert!(ensure_key_safe("dir/").is_err());
        assert!(ensure_key_safe(&"x".repeat(1025)).is_err());
    }

    #[test]
    fn key_validation_rejects_dot_segments() {
        for key in ["a/./b.md", "./a.md", "stories/.", "."] {
            assert!(ensure_key_safe(key).is_err(), "{:?}", key);
        }
        assert!(ensure_key_safe("stories/.hidden.md").is_ok());
        assert!(ensure_key_safe("stories/v1.0/a.md").is_ok());
    }

    #[test]
    fn continuation_tokens_round_trip_within_one_backend() {
        let token = encode_continuation_token("fs", "stories/2024/01/ü.md");
        assert_eq!(
            decode_continuation_token("fs", &token).unwrap(),
            "stories/2024/01/ü.md"
        );
        assert!(decode_continuation_token("object", &token).is_err());
        assert!(decode_continuation_token("fs", "not base64!").is_err());
    }
}
