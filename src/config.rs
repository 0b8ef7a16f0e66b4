use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, fmt, str::FromStr};

/// Which metadata index backend to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum IndexKind {
    #[default]
    Sqlite,
    Postgres,
    Sled,
}

/// Which content store backend to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    #[default]
    Filesystem,
    S3,
    Memory,
}

/// Backend selection plus every backend-specific connection parameter.
///
/// Values are only checked for presence when the selector builds the
/// chosen backends; parameters of unselected backends are ignored.
#[derive(Clone, Default)]
pub struct BackendSettings {
    pub index: IndexKind,
    pub store: StoreKind,
    /// sqlite:// or postgres:// connection string.
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Table holding story records on Postgres.
    pub postgres_table: Option<String>,
    pub sled_path: Option<String>,
    pub storage_dir: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub s3_prefix: Option<String>,
    pub s3_allow_http: bool,
}

// Credentials stay out of logs.
impl fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSettings")
            .field("index", &self.index)
            .field("store", &self.store)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("max_connections", &self.max_connections)
            .field("postgres_table", &self.postgres_table)
            .field("sled_path", &self.sled_path)
            .field("storage_dir", &self.storage_dir)
            .field("s3_bucket", &self.s3_bucket)
            .field("s3_region", &self.s3_region)
            .field("s3_endpoint", &self.s3_endpoint)
            .field("s3_prefix", &self.s3_prefix)
            .field("s3_allow_http", &self.s3_allow_http)
            .finish_non_exhaustive()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backends: BackendSettings,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Story publishing storage service")]
pub struct Args {
    /// Host to bind to (overrides STORYVAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides STORYVAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Metadata index backend (overrides STORYVAULT_INDEX)
    #[arg(long, value_enum)]
    pub index: Option<IndexKind>,

    /// Content store backend (overrides STORYVAULT_STORE)
    #[arg(long, value_enum)]
    pub store: Option<StoreKind>,

    /// Database URL for sqlite or postgres (overrides STORYVAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Connection pool size (overrides STORYVAULT_MAX_CONNECTIONS)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Postgres table name (overrides STORYVAULT_POSTGRES_TABLE)
    #[arg(long)]
    pub postgres_table: Option<String>,

    /// Directory of the sled database (overrides STORYVAULT_SLED_PATH)
    #[arg(long)]
    pub sled_path: Option<String>,

    /// Directory where story content is stored (overrides STORYVAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// S3 bucket (overrides STORYVAULT_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// S3 region (overrides STORYVAULT_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Custom S3 endpoint, e.g. MinIO (overrides STORYVAULT_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Key prefix inside the bucket (overrides STORYVAULT_S3_PREFIX)
    #[arg(long)]
    pub s3_prefix: Option<String>,

    /// Allow plain-http S3 endpoints (overrides STORYVAULT_S3_ALLOW_HTTP)
    #[arg(long)]
    pub s3_allow_http: bool,

    /// Apply the index schema and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env_string(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(None),
    }
}

fn env_kind<T: ValueEnum>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(value) => T::from_str(&value, true)
            .map(Some)
            .map_err(|err| anyhow::anyhow!("parsing {} value `{}`: {}", name, value, err)),
        None => Ok(None),
    }
}

fn env_flag(name: &str) -> bool {
    env_string(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win; environment fills the gaps; defaults fill the rest.
    fn merge(args: Args) -> Result<Self> {
        let index = match args.index {
            Some(kind) => kind,
            None => env_kind("STORYVAULT_INDEX")?.unwrap_or_default(),
        };
        let store = match args.store {
            Some(kind) => kind,
            None => env_kind("STORYVAULT_STORE")?.unwrap_or_default(),
        };

        // Local backends get working defaults; remote ones must be configured.
        let database_url = args
            .database_url
            .or_else(|| env_string("STORYVAULT_DATABASE_URL"))
            .or_else(|| {
                (index == IndexKind::Sqlite).then(|| "sqlite://./data/meta/stories.db".to_string())
            });

        let backends = BackendSettings {
            index,
            store,
            database_url,
            max_connections: match args.max_connections {
                Some(n) => n,
                None => env_parse("STORYVAULT_MAX_CONNECTIONS")?.unwrap_or(5),
            },
            postgres_table: args
                .postgres_table
                .or_else(|| env_string("STORYVAULT_POSTGRES_TABLE")),
            sled_path: args
                .sled_path
                .or_else(|| env_string("STORYVAULT_SLED_PATH"))
                .or_else(|| Some("./data/meta/sled".to_string())),
            storage_dir: args
                .storage_dir
                .or_else(|| env_string("STORYVAULT_STORAGE_DIR"))
                .or_else(|| Some("./data/stories".to_string())),
            s3_bucket: args.s3_bucket.or_else(|| env_string("STORYVAULT_S3_BUCKET")),
            s3_region: args.s3_region.or_else(|| env_string("STORYVAULT_S3_REGION")),
            s3_endpoint: args
                .s3_endpoint
                .or_else(|| env_string("STORYVAULT_S3_ENDPOINT")),
            // secrets only from the environment, never from argv
            s3_access_key_id: env_string("STORYVAULT_S3_ACCESS_KEY_ID"),
            s3_secret_access_key: env_string("STORYVAULT_S3_SECRET_ACCESS_KEY"),
            s3_prefix: args.s3_prefix.or_else(|| env_string("STORYVAULT_S3_PREFIX")),
            s3_allow_http: args.s3_allow_http || env_flag("STORYVAULT_S3_ALLOW_HTTP"),
        };

        Ok(Self {
            host: args
                .host
                .or_else(|| env_string("STORYVAULT_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: match args.port {
                Some(port) => port,
                None => env_parse("STORYVAULT_PORT")?.unwrap_or(3000),
            },
            backends,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_select_backends() {
        let args = Args::parse_from([
            "storyvault",
            "--index",
            "sled",
            "--store",
            "memory",
            "--sled-path",
            "/tmp/sled-test",
            "--port",
            "8088",
        ]);
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.port, 8088);
        assert_eq!(cfg.backends.index, IndexKind::Sled);
        assert_eq!(cfg.backends.store, StoreKind::Memory);
        assert_eq!(cfg.backends.sled_path.as_deref(), Some("/tmp/sled-test"));
        assert_eq!(cfg.addr(), format!("{}:8088", cfg.host));
    }

    #[test]
    fn unknown_backend_kind_is_rejected_by_the_parser() {
        assert!(Args::try_parse_from(["storyvault", "--index", "mysql"]).is_err());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let settings = BackendSettings {
            database_url: Some("postgres://user:hunter2@db/stories".into()),
            s3_secret_access_key: Some("hunter2".into()),
            ..BackendSettings::default()
        };
        assert!(!format!("{:?}", settings).contains("hunter2"));
    }
}
