use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

/// Failure kinds shared by every metadata index and content store backend.
///
/// A missing record or blob is never an error: lookups return `Ok(None)` and
/// deletes return `Ok(false)`.
#[derive(Debug, Error)]
pub enum StorageError {
    /// `storage_key` (or an equivalent unique attribute) is already taken.
    #[error("storage key `{storage_key}` is already in use")]
    Conflict { storage_key: String },

    /// Input rejected before or by the backend (bad key, out-of-range value).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Connectivity or infrastructure failure of the backing service.
    #[error("{backend} unavailable: {message}")]
    BackendUnavailable {
        backend: &'static str,
        message: String,
    },

    /// Local read/write failure of the storage layer itself.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Required backend configuration is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unavailable(backend: &'static str, msg: impl fmt::Display) -> Self {
        Self::BackendUnavailable {
            backend,
            message: msg.to_string(),
        }
    }

    /// True for failures an orchestrating layer may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                StorageError::Validation(db_err.message().to_string())
            }
            sqlx::Error::Io(io_err) => StorageError::unavailable("sql", io_err),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StorageError::Corrupt(err.to_string())
            }
            other => StorageError::unavailable("sql", other),
        }
    }
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(io_err) => StorageError::Io(io_err),
            sled::Error::Corruption { .. } => StorageError::Corrupt(err.to_string()),
            other => StorageError::unavailable("sled", other),
        }
    }
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        StorageError::unavailable("object storage", err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Validation(msg) => AppError::new(StatusCode::BAD_REQUEST, msg),
            StorageError::Conflict { .. } => AppError::new(
                StatusCode::CONFLICT,
                "a story with this storage key already exists, try a different story",
            ),
            StorageError::BackendUnavailable { .. } => {
                tracing::warn!("backend unavailable: {}", err);
                AppError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage is temporarily unavailable, retry later",
                )
            }
            other => {
                tracing::error!("storage failure: {}", other);
                AppError::internal(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_http_statuses() {
        let conflict = AppError::from(StorageError::Conflict {
            storage_key: "stories/a.md".into(),
        });
        assert_eq!(conflict.status, StatusCode::CONFLICT);

        let invalid = AppError::from(StorageError::validation("word count 12"));
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid.message, "word count 12");

        let down = AppError::from(StorageError::unavailable("sql", "pool timed out"));
        assert_eq!(down.status, StatusCode::SERVICE_UNAVAILABLE);

        let io = AppError::from(StorageError::Io(io::Error::other("disk full")));
        assert_eq!(io.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn only_backend_outages_are_retryable() {
        assert!(StorageError::unavailable("sled", "lock").is_retryable());
        assert!(!StorageError::validation("bad key").is_retryable());
        assert!(
            !StorageError::Conflict {
                storage_key: "k".into()
            }
            .is_retryable()
        );
    }
}
