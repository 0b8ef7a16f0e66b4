//! FilesystemStore — content blobs on local disk.
//!
//! Payloads are sharded beneath `root/{shard}/{shard}/{key}` using the first
//! two bytes of MD5(key), which keeps directory fan-out small. Content type,
//! user metadata and the MD5 etag live in a JSON sidecar under
//! `root/.meta/{shard}/{shard}/{key}.json` so `get_metadata` never touches
//! the payload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    ContentStore, DEFAULT_CONTENT_TYPE, ListOptions, ListResult, PutOptions,
    decode_continuation_token, ensure_key_safe, finish_page,
};
use crate::errors::{StorageError, StorageResult};
use crate::models::StoryFileMetadata;

const TOKEN_SCOPE: &str = "fs";
const META_DIR: &str = ".meta";
const TMP_PREFIX: &str = ".tmp-";

#[derive(Clone, Debug)]
pub struct FilesystemStore {
    /// Base directory on disk where story payloads are stored.
    base_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct Sidecar {
    content_type: Option<String>,
    etag: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl FilesystemStore {
    /// Create the store rooted at `base_path`, creating the directory if it
    /// does not exist.
    pub async fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        if !fs::try_exists(&base_path).await? {
            fs::create_dir_all(&base_path).await?;
            info!("Created storage directory at {}", base_path.display());
        }
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Generate two-level shard identifiers for a key.
    ///
    /// Uses MD5(key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff).
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Combines base_path/{shard}/{shard}/{key}. Parent directories may not
    /// exist yet.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.join(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.join(META_DIR);
        path.push(shard_a);
        path.push(shard_b);
        path.push(format!("{}.json", key));
        path
    }

    /// Write `bytes` to a temp file next to `path`, fsync, then rename into
    /// place. Cleans up the temp file on errors.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));

        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    async fn read_sidecar(&self, key: &str) -> StorageResult<Sidecar> {
        match fs::read(self.sidecar_path(key)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Sidecar::default()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn describe(&self, key: &str) -> StorageResult<Option<StoryFileMetadata>> {
        let stat = match fs::metadata(self.object_path(key)).await {
            Ok(stat) if stat.is_file() => stat,
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::Io(err)),
        };
        let sidecar = self.read_sidecar(key).await?;
        Ok(Some(StoryFileMetadata {
            key: key.to_string(),
            size: stat.len(),
            content_type: sidecar
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            last_modified: DateTime::<Utc>::from(stat.modified()?),
            etag: sidecar.etag,
            metadata: sidecar.metadata,
        }))
    }

    /// Every stored key in lexicographic order.
    async fn all_keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.base_path.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StorageError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(TMP_PREFIX) || (dir == self.base_path && name == META_DIR) {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_for_path(&path) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Reverse of `object_path`: drop the root and both shard components.
    fn key_for_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if parts.len() < 3 || parts[0].len() != 2 || parts[1].len() != 2 {
            return None;
        }
        Some(parts[2..].join("/"))
    }

    /// Recursively remove empty directories up to the root.
    ///
    /// Stops when the directory is not empty, is missing, or is the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ContentStore for FilesystemStore {
    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        ensure_key_safe(key)?;
        match fs::read_to_string(self.object_path(key)).await {
            Ok(content) => {
                debug!("Get {} bytes from {}", content.len(), key);
                Ok(Some(content))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    #[instrument(skip(self, content, options), fields(key = %key, size = content.len()))]
    async fn put(&self, key: &str, content: &str, options: PutOptions) -> StorageResult<()> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        Self::write_atomic(&file_path, content.as_bytes()).await?;

        let sidecar = Sidecar {
            content_type: options.content_type,
            etag: Some(format!("{:x}", md5::compute(content.as_bytes()))),
            metadata: options.metadata,
        };
        Self::write_atomic(&self.sidecar_path(key), &serde_json::to_vec(&sidecar)?).await?;
        debug!("Put {} bytes to {}", content.len(), file_path.display());
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> StorageResult<bool> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
                return Ok(false);
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        let sidecar = self.sidecar_path(key);
        match fs::remove_file(&sidecar).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        if let Some(parent) = sidecar.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn list(&self, options: ListOptions) -> StorageResult<ListResult> {
        let page_size = options.page_size();
        let after = options
            .continuation_token
            .as_deref()
            .map(|token| decode_continuation_token(TOKEN_SCOPE, token))
            .transpose()?;
        let prefix = options.prefix.as_deref().unwrap_or("");

        let keys: Vec<String> = self
            .all_keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .filter(|key| after.as_deref().is_none_or(|after| key.as_str() > after))
            .take(page_size + 1)
            .collect();

        let mut files = Vec::with_capacity(keys.len());
        for key in keys {
            // vanished between walk and stat
            if let Some(meta) = self.describe(&key).await? {
                files.push(meta);
            }
        }
        Ok(finish_page(TOKEN_SCOPE, files, page_size))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        ensure_key_safe(key)?;
        match fs::metadata(self.object_path(key)).await {
            Ok(stat) => Ok(stat.is_file()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get_metadata(&self, key: &str) -> StorageResult<Option<StoryFileMetadata>> {
        ensure_key_safe(key)?;
        self.describe(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (FilesystemStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemStore::new(tmp.path().join("blobs")).await.unwrap();
        (store, tmp)
    }

    #[tokio::test]
    async fn payload_lands_in_a_sharded_directory() {
        let (store, _tmp) = test_store().await;
        store
            .put("stories/a.md", "hello", PutOptions::default())
            .await
            .unwrap();
        let path = store.object_path("stories/a.md");
        assert!(path.exists());
        assert_eq!(
            store.key_for_path(&path).as_deref(),
            Some("stories/a.md")
        );
    }

    #[tokio::test]
    async fn metadata_comes_from_the_sidecar() {
        let (store, _tmp) = test_store().await;
        let options = PutOptions::content_type("text/plain").with_metadata("author", "did:plc:a");
        store.put("k.md", "hello world", options).await.unwrap();

        let meta = store.get_metadata("k.md").await.unwrap().unwrap();
        assert_eq!(meta.size, 11);
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(meta.etag.as_deref(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
        assert_eq!(meta.metadata.get("author").map(String::as_str), Some("did:plc:a"));
    }

    #[tokio::test]
    async fn delete_prunes_empty_shards() {
        let (store, _tmp) = test_store().await;
        store
            .put("deep/nested/key.md", "x", PutOptions::default())
            .await
            .unwrap();
        assert!(store.delete("deep/nested/key.md").await.unwrap());
        let mut entries = fs::read_dir(store.base_path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            panic!("left behind {}", entry.path().display());
        }
    }

    #[tokio::test]
    async fn listing_skips_sidecars_and_temp_files() {
        let (store, _tmp) = test_store().await;
        store.put("a.md", "a", PutOptions::default()).await.unwrap();
        let stray = store.object_path("a.md").with_file_name(".tmp-stray");
        fs::write(&stray, b"partial").await.unwrap();

        let listed = store.list(ListOptions::default()).await.unwrap();
        let keys: Vec<_> = listed.files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, ["a.md"]);
    }

    #[tokio::test]
    async fn rejects_unsafe_keys() {
        let (store, _tmp) = test_store().await;
        let err = store
            .put("../escape.md", "x", PutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }
}
