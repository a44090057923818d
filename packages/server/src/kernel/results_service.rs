//! Results service: validates ownership, persists artifacts and the result
//! record, and triggers the result callback.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;

use crate::common::{QueueError, QueueResult, TaskId};
use crate::kernel::artifacts::{ArtifactIn, ArtifactStore};
use crate::kernel::metrics::QueueMetrics;
use crate::kernel::queue::repo::TaskRepo;
use crate::kernel::queue::results::{ArtifactOut, ResultRecord, ResultRepo};
use crate::kernel::queue::task::TaskStatus;
use crate::kernel::result_callback::ResultCallback;

pub struct SubmitResult {
    pub status: TaskStatus,
    pub result: Option<serde_json::Map<String, serde_json::Value>>,
    pub error: Option<String>,
    pub artifacts: Vec<ArtifactIn>,
}

pub struct ResultsService {
    tasks: Arc<TaskRepo>,
    results: Arc<ResultRepo>,
    artifacts: Arc<dyn ArtifactStore>,
    callback: Arc<ResultCallback>,
    metrics: Arc<QueueMetrics>,
}

impl ResultsService {
    pub fn new(
        tasks: Arc<TaskRepo>,
        results: Arc<ResultRepo>,
        artifacts: Arc<dyn ArtifactStore>,
        callback: Arc<ResultCallback>,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        Self {
            tasks,
            results,
            artifacts,
            callback,
            metrics,
        }
    }

    pub async fn submit(
        &self,
        tenant_id: &str,
        task_id: &TaskId,
        worker_id: &str,
        input: SubmitResult,
    ) -> QueueResult<ResultRecord> {
        if !input.status.is_terminal() {
            return Err(QueueError::bad_input(
                "result status must be COMPLETED or FAILED",
            ));
        }

        let task = self.tasks.get(task_id).await?;
        if task.tenant_id != tenant_id {
            return Err(QueueError::NotFound("task"));
        }
        if task.status != TaskStatus::InProgress {
            return Err(QueueError::NotInProgress);
        }

        // Ownership is re-checked atomically by the store script; checking
        // here keeps a non-owner from uploading artifacts first.
        match self.tasks.lease_owner(task_id).await? {
            Some(owner) if owner == worker_id => {}
            _ => return Err(QueueError::NotOwner),
        }

        let artifacts = self.persist_artifacts(task_id, input.artifacts).await?;

        let record = ResultRecord {
            task_id: *task_id,
            status: input.status,
            result: input.result.unwrap_or_default(),
            error: input.error,
            artifacts,
            completed_at: Utc::now(),
        };

        self.results.store(&task, worker_id, &record).await?;
        self.metrics
            .tasks_completed
            .with_label_values(&[task.command.as_str(), record.status.as_str()])
            .inc();

        if let Some(webhook) = &task.webhook {
            self.callback.deliver(webhook.clone(), (&record).into());
        }
        Ok(record)
    }

    pub async fn get_result(
        &self,
        tenant_id: &str,
        task_id: &TaskId,
    ) -> QueueResult<ResultRecord> {
        let task = self.tasks.get(task_id).await?;
        if task.tenant_id != tenant_id {
            return Err(QueueError::NotFound("task"));
        }
        self.results
            .get(task_id)
            .await?
            .ok_or(QueueError::NotFound("result"))
    }

    /// Rewrite each inbound artifact to a stored `(name, url)` pair.
    async fn persist_artifacts(
        &self,
        task_id: &TaskId,
        inbound: Vec<ArtifactIn>,
    ) -> QueueResult<Vec<ArtifactOut>> {
        let mut out = Vec::with_capacity(inbound.len());
        for artifact in inbound {
            if artifact.name.is_empty() {
                return Err(QueueError::bad_input("artifact name must not be empty"));
            }
            let url = match (artifact.url, artifact.body) {
                (Some(url), _) => url,
                (None, Some(body)) => {
                    let bytes = BASE64.decode(body.as_bytes()).map_err(|_| {
                        QueueError::bad_input(format!(
                            "artifact {} body is not valid base64",
                            artifact.name
                        ))
                    })?;
                    self.artifacts.put(task_id, &artifact.name, bytes).await?
                }
                (None, None) => {
                    return Err(QueueError::bad_input(format!(
                        "artifact {} needs either url or body",
                        artifact.name
                    )))
                }
            };
            out.push(ArtifactOut {
                name: artifact.name,
                url,
            });
        }
        Ok(out)
    }
}
