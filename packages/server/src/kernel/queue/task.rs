//! Task model and its KV hash mapping.

use std::collections::HashMap;

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{QueueError, QueueResult, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A queued unit of work. A task awaiting delayed visibility keeps status
/// `PENDING`; placement (pending list vs delayed index) is tracked by the
/// queue collections, not the hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub command: String,
    pub tenant_id: String,
    pub payload: serde_json::Value,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    pub max_attempts: u32,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Flatten into `HSET` field/value pairs. Options map to empty strings.
    pub fn hash_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("id", self.id.to_string()),
            ("command", self.command.clone()),
            ("tenant_id", self.tenant_id.clone()),
            ("payload", self.payload.to_string()),
            ("priority", self.priority.to_string()),
            ("webhook", self.webhook.clone().unwrap_or_default()),
            ("max_attempts", self.max_attempts.to_string()),
            ("status", self.status.as_str().to_string()),
            ("worker_id", self.worker_id.clone().unwrap_or_default()),
            (
                "lease_until",
                self.lease_until
                    .map(|t| t.timestamp().to_string())
                    .unwrap_or_default(),
            ),
            ("attempts", self.attempts.to_string()),
            ("error", self.error.clone().unwrap_or_default()),
            ("result_key", self.result_key.clone().unwrap_or_default()),
            ("created_at", self.created_at.timestamp().to_string()),
            ("updated_at", self.updated_at.timestamp().to_string()),
        ]
    }

    /// Rebuild from an `HGETALL` reply. An empty or unparsable hash is an
    /// invariant violation, not caller error.
    pub fn from_hash(map: &HashMap<String, String>) -> QueueResult<Self> {
        let field = |name| field(map, name);
        let optional = |name| optional(map, name);

        let id: TaskId = field("id")?
            .parse()
            .map_err(|e| QueueError::Internal(anyhow!("task hash has invalid id: {e}")))?;
        let status = TaskStatus::parse(field("status")?)
            .ok_or_else(|| QueueError::Internal(anyhow!("task hash has invalid status")))?;
        let payload = serde_json::from_str(field("payload")?)
            .map_err(|e| QueueError::Internal(anyhow!("task hash has invalid payload: {e}")))?;

        Ok(Self {
            id,
            command: field("command")?.to_string(),
            tenant_id: map.get("tenant_id").cloned().unwrap_or_default(),
            payload,
            priority: field("priority")?.parse().unwrap_or(0),
            webhook: optional("webhook"),
            max_attempts: field("max_attempts")?.parse().unwrap_or(0),
            status,
            worker_id: optional("worker_id"),
            lease_until: optional("lease_until").and_then(|v| parse_unix(&v)),
            attempts: field("attempts")?.parse().unwrap_or(0),
            error: optional("error"),
            result_key: optional("result_key"),
            created_at: optional("created_at")
                .and_then(|v| parse_unix(&v))
                .unwrap_or_else(Utc::now),
            updated_at: optional("updated_at")
                .and_then(|v| parse_unix(&v))
                .unwrap_or_else(Utc::now),
        })
    }
}

fn field<'m>(map: &'m HashMap<String, String>, name: &str) -> QueueResult<&'m str> {
    map.get(name)
        .map(String::as_str)
        .ok_or_else(|| QueueError::Internal(anyhow!("task hash missing field {name}")))
}

fn optional(map: &HashMap<String, String>, name: &str) -> Option<String> {
    map.get(name).filter(|v| !v.is_empty()).cloned()
}

fn parse_unix(value: &str) -> Option<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Task {
        Task {
            id: TaskId::new(),
            command: "GENERATE_MASTER".to_string(),
            tenant_id: "acme".to_string(),
            payload: json!({"jobId": "j1"}),
            priority: 5,
            webhook: Some("https://example.com/hook".to_string()),
            max_attempts: 3,
            status: TaskStatus::Pending,
            worker_id: None,
            lease_until: None,
            attempts: 0,
            error: None,
            result_key: None,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn hash_roundtrip() {
        let task = sample();
        let map: HashMap<String, String> = task
            .hash_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let rebuilt = Task::from_hash(&map).unwrap();
        assert_eq!(rebuilt.id, task.id);
        assert_eq!(rebuilt.command, task.command);
        assert_eq!(rebuilt.tenant_id, task.tenant_id);
        assert_eq!(rebuilt.payload, task.payload);
        assert_eq!(rebuilt.priority, task.priority);
        assert_eq!(rebuilt.webhook, task.webhook);
        assert_eq!(rebuilt.status, TaskStatus::Pending);
        assert_eq!(rebuilt.worker_id, None);
        assert_eq!(rebuilt.lease_until, None);
        assert_eq!(rebuilt.created_at, task.created_at);
    }

    #[test]
    fn empty_hash_is_an_error() {
        assert!(Task::from_hash(&HashMap::new()).is_err());
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!(TaskStatus::parse("FAILED"), Some(TaskStatus::Failed));
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("tenantId").is_some());
        assert!(json.get("maxAttempts").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("workerId").is_none());
    }
}
