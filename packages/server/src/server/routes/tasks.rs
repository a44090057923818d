//! Task endpoints: create, claim, heartbeat, nack, abandon, result.

use axum::extract::{Extension, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{QueueError, QueueResult, TaskId};
use crate::kernel::artifacts::ArtifactIn;
use crate::kernel::queue::results::ResultRecord;
use crate::kernel::queue::task::{Task, TaskStatus};
use crate::kernel::results_service::SubmitResult;
use crate::kernel::scheduler::{ClaimOptions, CreateTask};
use crate::server::app::AppState;
use crate::server::middleware::AuthContext;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateTaskRequest {
    pub command: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delay_seconds: Option<i64>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateTaskRequest>,
) -> QueueResult<(StatusCode, Json<Task>)> {
    let task = state
        .scheduler
        .create_task(
            &auth.tenant_id,
            CreateTask {
                command: body.command,
                payload: body.payload,
                priority: body.priority,
                webhook: body.webhook,
                max_attempts: body.max_attempts,
                idempotency_key: body.idempotency_key,
                run_at: body.run_at,
                delay_seconds: body.delay_seconds,
            },
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    #[serde(default)]
    pub commands: Option<Vec<String>>,
    #[serde(default)]
    pub lease_seconds: Option<u64>,
    #[serde(default)]
    pub wait_seconds: Option<u64>,
}

pub async fn claim_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ClaimRequest>,
) -> QueueResult<Response> {
    let claimed = state
        .scheduler
        .claim(
            &auth.tenant_id,
            &auth.subject,
            ClaimOptions {
                commands: body.commands.unwrap_or_default(),
                lease_seconds: body.lease_seconds,
                wait_seconds: body.wait_seconds,
            },
        )
        .await?;

    Ok(match claimed {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub extend_seconds: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub lease_until: DateTime<Utc>,
}

pub async fn heartbeat_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatRequest>,
) -> QueueResult<Json<HeartbeatResponse>> {
    let id = parse_id(&id)?;
    let lease_until = state
        .scheduler
        .heartbeat(&auth.tenant_id, &id, &auth.subject, body.extend_seconds)
        .await?;
    Ok(Json(HeartbeatResponse { lease_until }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NackRequest {
    #[serde(default)]
    pub delay_seconds: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NackResponse {
    pub status: &'static str,
    pub delay_seconds: i64,
}

pub async fn nack_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<NackRequest>,
) -> QueueResult<Json<NackResponse>> {
    let id = parse_id(&id)?;
    let outcome = state
        .scheduler
        .nack(
            &auth.tenant_id,
            &id,
            &auth.subject,
            body.delay_seconds,
            body.reason,
        )
        .await?;
    Ok(Json(NackResponse {
        status: if outcome.moved_to_dlq { "dlq" } else { "requeued" },
        delay_seconds: outcome.delay_seconds,
    }))
}

pub async fn abandon_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> QueueResult<Json<NackResponse>> {
    let id = parse_id(&id)?;
    let outcome = state
        .scheduler
        .abandon(&auth.tenant_id, &id, &auth.subject)
        .await?;
    Ok(Json(NackResponse {
        status: if outcome.moved_to_dlq { "dlq" } else { "requeued" },
        delay_seconds: outcome.delay_seconds,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResultRequest {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactIn>,
}

pub async fn submit_result(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<SubmitResultRequest>,
) -> QueueResult<Json<ResultRecord>> {
    let id = parse_id(&id)?;
    let record = state
        .results
        .submit(
            &auth.tenant_id,
            &id,
            &auth.subject,
            SubmitResult {
                status: body.status,
                result: body.result,
                error: body.error,
                artifacts: body.artifacts,
            },
        )
        .await?;
    Ok(Json(record))
}

pub async fn get_task(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> QueueResult<Json<Task>> {
    let id = parse_id(&id)?;
    Ok(Json(state.scheduler.get_task(&auth.tenant_id, &id).await?))
}

pub async fn get_result(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> QueueResult<Json<ResultRecord>> {
    let id = parse_id(&id)?;
    Ok(Json(state.results.get_result(&auth.tenant_id, &id).await?))
}

fn parse_id(raw: &str) -> QueueResult<TaskId> {
    raw.parse()
        .map_err(|_| QueueError::bad_input("invalid task id"))
}
