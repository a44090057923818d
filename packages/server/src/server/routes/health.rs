//! Health check endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    kv: KvHealth,
}

#[derive(Serialize)]
pub struct KvHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Returns 200 when the KV store answers a PING within 5s, 503 otherwise.
pub async fn health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let kv = match tokio::time::timeout(std::time::Duration::from_secs(5), state.kv.ping()).await
    {
        Ok(Ok(())) => KvHealth {
            status: "ok".to_string(),
            error: None,
        },
        Ok(Err(e)) => KvHealth {
            status: "error".to_string(),
            error: Some(format!("ping failed: {e}")),
        },
        Err(_) => KvHealth {
            status: "error".to_string(),
            error: Some("ping timeout (>5s)".to_string()),
        },
    };

    let healthy = kv.status == "ok";
    (
        if healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        },
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            kv,
        }),
    )
}
