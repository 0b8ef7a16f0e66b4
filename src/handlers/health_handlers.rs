//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata index and the
//!   content store

use crate::services::story_service::StoryService;
use crate::store::PutOptions;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Pings the metadata index.
/// 2. Performs a write/read/delete round trip against the content store.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(service): State<StoryService>) -> impl IntoResponse {
    let backends = service.backends();

    let index_check = match backends.index.ping().await {
        Ok(()) => CheckStatus::ok(),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let probe_key = format!("readyz/{}", Uuid::new_v4());
    let store_check = match backends
        .store
        .put(&probe_key, "readyz", PutOptions::content_type("text/plain"))
        .await
    {
        Ok(()) => {
            let read = backends.store.get(&probe_key).await;
            if let Err(e) = backends.store.delete(&probe_key).await {
                warn!(key = %probe_key, error = %e, "could not remove readiness probe");
            }
            match read {
                Ok(Some(body)) if body == "readyz" => CheckStatus::ok(),
                Ok(_) => CheckStatus::failed("probe content mismatch".into()),
                Err(e) => CheckStatus::failed(format!("could not read probe: {}", e)),
            }
        }
        Err(e) => CheckStatus::failed(format!("could not write probe: {}", e)),
    };

    let overall_ok = index_check.ok && store_check.ok;

    let mut checks = HashMap::new();
    checks.insert(backends.index.backend_name(), index_check);
    checks.insert(backends.store.backend_name(), store_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
