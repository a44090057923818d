//! Admin endpoints: queue aggregates, per-command stats, manual cleanup.

use axum::extract::{Extension, Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::QueueResult;
use crate::kernel::queue::repo::{QueueAggregate, QueueStats};
use crate::server::app::AppState;
use crate::server::middleware::AuthContext;

pub async fn list_queues(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> QueueResult<Json<Vec<QueueAggregate>>> {
    auth.require_admin()?;
    Ok(Json(state.scheduler.admin_queues().await?))
}

pub async fn queue_stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(command): Path<String>,
) -> QueueResult<Json<QueueStats>> {
    auth.require_admin()?;
    Ok(Json(
        state.scheduler.queue_stats(&command, &auth.tenant_id).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    #[serde(default)]
    pub limit: Option<usize>,
    /// RFC3339; defaults to now.
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub deleted: u64,
}

pub async fn cleanup_tasks(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CleanupRequest>,
) -> QueueResult<Json<CleanupResponse>> {
    auth.require_admin()?;
    let deleted = state
        .scheduler
        .cleanup(
            body.limit.unwrap_or(state.config.cleanup_batch),
            body.before.unwrap_or_else(Utc::now),
        )
        .await?;
    Ok(Json(CleanupResponse { deleted }))
}
