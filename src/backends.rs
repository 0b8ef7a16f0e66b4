//! Backend selector: turns `BackendSettings` into live index and store
//! handles.
//!
//! Connections are made eagerly so a misconfigured or unreachable backend
//! fails at startup rather than on the first request. The returned handle is
//! an explicit context object; nothing here is process-global, so several
//! handles (of different kinds) can coexist in one process.

use std::sync::Arc;
use tracing::info;

use crate::config::{BackendSettings, IndexKind, StoreKind};
use crate::errors::{StorageError, StorageResult};
use crate::index::{
    MetadataIndex, POSTGRES_TABLE, PostgresIndex, SLED_NAMESPACE, SledIndex, SqliteIndex,
};
use crate::store::{ContentStore, FilesystemStore, ObjectContentStore, S3Config};

/// The pair of backends one service instance works against.
#[derive(Clone)]
pub struct Backends {
    pub index: Arc<dyn MetadataIndex>,
    pub store: Arc<dyn ContentStore>,
}

impl Backends {
    pub fn new(index: Arc<dyn MetadataIndex>, store: Arc<dyn ContentStore>) -> Self {
        Self { index, store }
    }

    /// Close the index pool / flush sled and release the content store.
    pub async fn shutdown(&self) {
        info!(
            index = self.index.backend_name(),
            store = self.store.backend_name(),
            "shutting down backends"
        );
        self.index.close().await;
        self.store.close().await;
    }
}

fn require<'a>(value: &'a Option<String>, what: &str, kind: &str) -> StorageResult<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| StorageError::Config(format!("{} backend requires {}", kind, what)))
}

/// Build both backends. The index is connected (and migrated) first.
pub async fn connect(settings: &BackendSettings) -> StorageResult<Backends> {
    let index = connect_index(settings).await?;
    let store = match connect_store(settings).await {
        Ok(store) => store,
        Err(err) => {
            index.close().await;
            return Err(err);
        }
    };
    info!(
        index = index.backend_name(),
        store = store.backend_name(),
        "backends ready"
    );
    Ok(Backends::new(index, store))
}

pub async fn connect_index(settings: &BackendSettings) -> StorageResult<Arc<dyn MetadataIndex>> {
    let index: Arc<dyn MetadataIndex> = match settings.index {
        IndexKind::Sqlite => {
            let url = require(&settings.database_url, "a database url", "sqlite")?;
            Arc::new(SqliteIndex::connect(url, settings.max_connections).await?)
        }
        IndexKind::Postgres => {
            let url = require(&settings.database_url, "a database url", "postgres")?;
            let table = settings
                .postgres_table
                .as_deref()
                .unwrap_or(POSTGRES_TABLE);
            Arc::new(PostgresIndex::connect(url, settings.max_connections, table).await?)
        }
        IndexKind::Sled => {
            let path = require(&settings.sled_path, "a database path", "sled")?;
            Arc::new(SledIndex::open(path, SLED_NAMESPACE)?)
        }
    };
    Ok(index)
}

pub async fn connect_store(settings: &BackendSettings) -> StorageResult<Arc<dyn ContentStore>> {
    let store: Arc<dyn ContentStore> = match settings.store {
        StoreKind::Filesystem => {
            let root = require(&settings.storage_dir, "a storage directory", "filesystem")?;
            Arc::new(FilesystemStore::new(root).await?)
        }
        StoreKind::S3 => {
            let bucket = require(&settings.s3_bucket, "a bucket name", "s3")?;
            let config = S3Config {
                bucket: bucket.to_string(),
                region: settings.s3_region.clone(),
                endpoint: settings.s3_endpoint.clone(),
                access_key_id: settings.s3_access_key_id.clone(),
                secret_access_key: settings.s3_secret_access_key.clone(),
                prefix: settings.s3_prefix.clone(),
                allow_http: settings.s3_allow_http,
            };
            Arc::new(ObjectContentStore::s3(&config)?)
        }
        StoreKind::Memory => Arc::new(ObjectContentStore::in_memory()),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_parameters_fail_fast() {
        let settings = BackendSettings {
            index: IndexKind::Postgres,
            ..BackendSettings::default()
        };
        let err = connect_index(&settings).await.err().unwrap();
        assert!(matches!(err, StorageError::Config(msg) if msg.contains("postgres")));

        let settings = BackendSettings {
            store: StoreKind::S3,
            ..BackendSettings::default()
        };
        let err = connect_store(&settings).await.err().unwrap();
        assert!(matches!(err, StorageError::Config(msg) if msg.contains("bucket")));
    }

    #[tokio::test]
    async fn builds_local_backends_side_by_side() {
        let tmp = TempDir::new().unwrap();
        let sqlite = BackendSettings {
            index: IndexKind::Sqlite,
            store: StoreKind::Filesystem,
            database_url: Some(format!("sqlite://{}", tmp.path().join("idx.db").display())),
            max_connections: 2,
            storage_dir: Some(tmp.path().join("blobs").display().to_string()),
            ..BackendSettings::default()
        };
        let sled = BackendSettings {
            index: IndexKind::Sled,
            store: StoreKind::Memory,
            sled_path: Some(tmp.path().join("sled").display().to_string()),
            ..BackendSettings::default()
        };

        let a = connect(&sqlite).await.unwrap();
        let b = connect(&sled).await.unwrap();
        assert_eq!(a.index.backend_name(), "sqlite");
        assert_eq!(a.store.backend_name(), "filesystem");
        assert_eq!(b.index.backend_name(), "sled");
        assert_eq!(b.store.backend_name(), "memory");
        a.index.ping().await.unwrap();
        b.index.ping().await.unwrap();
        a.shutdown().await;
        b.shutdown().await;
    }
}
