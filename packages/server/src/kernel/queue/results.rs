//! Result records and their terminal-transition script.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::Value;
use serde::{Deserialize, Serialize};

use crate::common::{QueueError, QueueResult, TaskId};
use crate::kernel::kv::{reply_int, Kv};
use crate::kernel::queue::keys;
use crate::kernel::queue::scripts::ScriptSet;
use crate::kernel::queue::task::{Task, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactOut {
    pub name: String,
    pub url: String,
}

/// Terminal outcome of a task. Written exactly once per terminal
/// transition; an idempotent overwrite is permitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactOut>,
    pub completed_at: DateTime<Utc>,
}

pub struct ResultRepo {
    kv: Kv,
    scripts: Arc<ScriptSet>,
}

impl ResultRepo {
    pub fn new(kv: Kv, scripts: Arc<ScriptSet>) -> Self {
        Self { kv, scripts }
    }

    /// Persist the record and clear the task's in-progress state in one
    /// atomic transition.
    pub async fn store(
        &self,
        task: &Task,
        worker_id: &str,
        record: &ResultRecord,
    ) -> QueueResult<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| QueueError::Internal(anyhow::anyhow!("result encoding failed: {e}")))?;
        let result_key = keys::result(&task.id);

        let script_keys = vec![
            keys::lease(&task.id),
            keys::task(&task.id),
            keys::in_progress(&task.command, &task.tenant_id),
            result_key.clone(),
        ];
        let args = vec![
            worker_id.to_string(),
            Utc::now().timestamp().to_string(),
            task.id.to_string(),
            record.status.as_str().to_string(),
            record.error.clone().unwrap_or_default(),
            json,
            result_key,
        ];

        let reply: Vec<Value> = self
            .kv
            .script(&self.scripts.store_result, &script_keys, &args)
            .await?;
        match reply_int(&reply, 0)? {
            1 => Ok(()),
            -2 => Err(QueueError::NotFound("task")),
            -3 => Err(QueueError::NotInProgress),
            _ => Err(QueueError::NotOwner),
        }
    }

    pub async fn get(&self, id: &TaskId) -> QueueResult<Option<ResultRecord>> {
        let mut conn = self.kv.conn();
        let raw: Option<String> = redis::cmd("GET")
            .arg(keys::result(id))
            .query_async(&mut conn)
            .await?;
        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| QueueError::Internal(anyhow::anyhow!("result record corrupt: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_roundtrips() {
        let record = ResultRecord {
            task_id: TaskId::new(),
            status: TaskStatus::Completed,
            result: json!({"ok": true}).as_object().unwrap().clone(),
            error: None,
            artifacts: vec![ArtifactOut {
                name: "master.wav".to_string(),
                url: "https://blobs.example.com/master.wav".to_string(),
            }],
            completed_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: ResultRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.task_id, record.task_id);
        assert_eq!(decoded.status, TaskStatus::Completed);
        assert_eq!(decoded.artifacts, record.artifacts);
    }

    #[test]
    fn record_wire_shape_is_camel_case() {
        let record = ResultRecord {
            task_id: TaskId::new(),
            status: TaskStatus::Failed,
            result: Default::default(),
            error: Some("boom".to_string()),
            artifacts: Vec::new(),
            completed_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("taskId").is_some());
        assert!(json.get("completedAt").is_some());
    }
}
