//! Object storage content store built on the `object_store` crate.
//!
//! Covers any S3-compatible endpoint (AWS S3, MinIO, Ceph) and an in-process
//! `InMemory` store for development. Content type and user metadata travel as
//! object attributes.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectMeta, ObjectStore, PutPayload,
};
use std::{borrow::Cow, collections::HashMap};
use tracing::{debug, instrument};

use super::{
    ContentStore, DEFAULT_CONTENT_TYPE, ListOptions, ListResult, PutOptions,
    decode_continuation_token, ensure_key_safe, finish_page,
};
use crate::errors::{StorageError, StorageResult};
use crate::models::StoryFileMetadata;

const TOKEN_SCOPE: &str = "object";
const LIST_CONCURRENCY: usize = 16;

/// Connection parameters for an S3-compatible bucket.
#[derive(Clone, Debug, Default)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint for MinIO and other S3-compatible services.
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Key prefix inside the bucket.
    pub prefix: Option<String>,
    pub allow_http: bool,
}

pub struct ObjectContentStore {
    store: Box<dyn ObjectStore>,
    /// Path prefix inside the bucket, without surrounding slashes.
    prefix: String,
    backend: &'static str,
}

impl ObjectContentStore {
    /// S3-compatible bucket. Credentials fall back to the usual `AWS_*`
    /// environment variables when not configured explicitly.
    pub fn s3(config: &S3Config) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);
        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(access_key) = &config.access_key_id {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        let store = builder
            .with_allow_http(config.allow_http)
            .build()
            .map_err(|e| {
                StorageError::Config(format!(
                    "failed to create S3 client for bucket `{}`: {}",
                    config.bucket, e
                ))
            })?;

        debug!(bucket = %config.bucket, prefix = ?config.prefix, "S3 content store initialised");
        Ok(Self::with_store(
            Box::new(store),
            config.prefix.as_deref().unwrap_or(""),
            "s3",
        ))
    }

    pub fn in_memory() -> Self {
        Self::with_store(Box::new(InMemory::new()), "", "memory")
    }

    fn with_store(store: Box<dyn ObjectStore>, prefix: &str, backend: &'static str) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            backend,
        }
    }

    fn full_path(&self, key: &str) -> StorageResult<ObjectPath> {
        ensure_key_safe(key)?;
        let raw = if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        };
        ObjectPath::parse(&raw)
            .map_err(|e| StorageError::validation(format!("invalid key `{}`: {}", key, e)))
    }

    fn key_for_location(&self, location: &ObjectPath) -> String {
        let full = location.to_string();
        if self.prefix.is_empty() {
            return full;
        }
        match full.strip_prefix(&format!("{}/", self.prefix)) {
            Some(key) => key.to_string(),
            None => full,
        }
    }

    /// Directory part of a string prefix; `list` operates on whole path
    /// segments so the remainder is filtered client-side.
    fn listing_root(&self, prefix: &str) -> Option<ObjectPath> {
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let raw = match (self.prefix.is_empty(), dir.is_empty()) {
            (true, true) => return None,
            (true, false) => dir.to_string(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, dir),
        };
        Some(ObjectPath::from(raw))
    }

    async fn head(&self, path: &ObjectPath) -> StorageResult<Option<(ObjectMeta, Attributes)>> {
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        match self.store.get_opts(path, options).await {
            Ok(result) => Ok(Some((result.meta, result.attributes))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self, meta: ObjectMeta, attributes: &Attributes) -> StoryFileMetadata {
        let content_type = attributes
            .get(&Attribute::ContentType)
            .map(|v| v.as_ref().to_string())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let metadata = attributes
            .iter()
            .filter_map(|(attr, value)| match attr {
                Attribute::Metadata(name) => Some((name.to_string(), value.as_ref().to_string())),
                _ => None,
            })
            .collect::<HashMap<_, _>>();
        StoryFileMetadata {
            key: self.key_for_location(&meta.location),
            size: meta.size as u64,
            content_type,
            last_modified: meta.last_modified,
            etag: meta.e_tag,
            metadata,
        }
    }
}

#[async_trait]
impl ContentStore for ObjectContentStore {
    fn backend_name(&self) -> &'static str {
        self.backend
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.full_path(key)?;
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let bytes = result.bytes().await?;
        let content = String::from_utf8(bytes.to_vec())
            .map_err(|_| StorageError::Corrupt(format!("content at `{}` is not UTF-8", key)))?;
        Ok(Some(content))
    }

    #[instrument(skip(self, content, options), fields(key = %key, size = content.len()))]
    async fn put(&self, key: &str, content: &str, options: PutOptions) -> StorageResult<()> {
        let path = self.full_path(key)?;
        let mut attributes = Attributes::new();
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(
                options
                    .content_type
                    .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            ),
        );
        for (name, value) in options.metadata {
            attributes.insert(Attribute::Metadata(Cow::Owned(name)), AttributeValue::from(value));
        }
        let put_options = object_store::PutOptions {
            attributes,
            ..Default::default()
        };
        self.store
            .put_opts(&path, PutPayload::from(content.to_string()), put_options)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let path = self.full_path(key)?;
        // object store deletes are idempotent, so probe first to report absence
        if self.head(&path).await?.is_none() {
            return Ok(false);
        }
        match self.store.delete(&path).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, options: ListOptions) -> StorageResult<ListResult> {
        let page_size = options.page_size();
        let prefix = options.prefix.clone().unwrap_or_default();
        let root = self.listing_root(&prefix);

        let listing = match options.continuation_token.as_deref() {
            Some(token) => {
                let after = decode_continuation_token(TOKEN_SCOPE, token)?;
                let offset = self.full_path(&after)?;
                self.store.list_with_offset(root.as_ref(), &offset)
            }
            None => self.store.list(root.as_ref()),
        };
        let mut matches: Vec<ObjectMeta> = listing
            .try_filter(|meta| {
                let keep = self.key_for_location(&meta.location).starts_with(&prefix);
                futures::future::ready(keep)
            })
            .try_collect()
            .await?;
        matches.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));
        matches.truncate(page_size + 1);

        // listings carry no attributes; fetch them per object
        let files: Vec<StoryFileMetadata> = stream::iter(matches)
            .map(|meta| async move {
                let attributes = self
                    .head(&meta.location)
                    .await?
                    .map(|(_, attributes)| attributes)
                    .unwrap_or_default();
                Ok::<_, StorageError>(self.describe(meta, &attributes))
            })
            .buffered(LIST_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(finish_page(TOKEN_SCOPE, files, page_size))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.full_path(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get_metadata(&self, key: &str) -> StorageResult<Option<StoryFileMetadata>> {
        let path = self.full_path(key)?;
        Ok(self
            .head(&path)
            .await?
            .map(|(meta, attributes)| self.describe(meta, &attributes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_root_is_the_directory_part_of_the_prefix() {
        let store = ObjectContentStore::in_memory();
        assert_eq!(store.listing_root(""), None);
        assert_eq!(store.listing_root("stor"), None);
        assert_eq!(
            store.listing_root("stories/2024/0").map(|p| p.to_string()),
            Some("stories/2024".to_string())
        );

        let prefixed = ObjectContentStore::with_store(Box::new(InMemory::new()), "/tenant/", "memory");
        assert_eq!(
            prefixed.listing_root("").map(|p| p.to_string()),
            Some("tenant".to_string())
        );
        assert_eq!(
            prefixed.listing_root("stories/x").map(|p| p.to_string()),
            Some("tenant/stories".to_string())
        );
    }

    #[tokio::test]
    async fn attributes_carry_content_type_and_metadata() {
        let store = ObjectContentStore::in_memory();
        let options = PutOptions::content_type("text/plain").with_metadata("author", "did:plc:a");
        store.put("a.md", "hello", options).await.unwrap();

        let meta = store.get_metadata("a.md").await.unwrap().unwrap();
        assert_eq!(meta.key, "a.md");
        assert_eq!(meta.size, 5);
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(meta.metadata.get("author").map(String::as_str), Some("did:plc:a"));
    }

    #[tokio::test]
    async fn bucket_prefix_is_hidden_from_keys() {
        let store = ObjectContentStore::with_store(Box::new(InMemory::new()), "tenant", "memory");
        store.put("stories/a.md", "a", PutOptions::default()).await.unwrap();
        let listed = store.list(ListOptions::prefix("stories/")).await.unwrap();
        let keys: Vec<_> = listed.files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, ["stories/a.md"]);
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let store = ObjectContentStore::in_memory();
        store.put("a.md", "a", PutOptions::default()).await.unwrap();
        assert!(store.delete("a.md").await.unwrap());
        assert!(!store.delete("a.md").await.unwrap());
        assert_eq!(store.get("a.md").await.unwrap(), None);
    }
}
