//! Webhook payload shapes for the two delivery channels.

use serde::{Deserialize, Serialize};

use crate::common::TaskId;
use crate::kernel::queue::results::ResultRecord;
use crate::kernel::queue::task::{Task, TaskStatus};

/// Creation fan-out body: an event tag plus the task fields at top level.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreationEvent<'a> {
    pub event: &'static str,
    #[serde(flatten)]
    pub task: &'a Task,
}

impl<'a> CreationEvent<'a> {
    pub fn new(task: &'a Task) -> Self {
        Self {
            event: "task.created",
            task,
        }
    }
}

/// Result-callback body delivered to the task's own webhook URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEvent {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ResultRecord> for ResultEvent {
    fn from(record: &ResultRecord) -> Self {
        Self {
            task_id: record.task_id,
            status: record.status,
            result: record.result.clone(),
            error: record.error.clone(),
        }
    }
}
