//! Queue key layout.
//!
//! Every key is namespaced by tenant when the tenant is non-empty:
//!
//! ```text
//! q:{cmd}[:{tenant}]:pending:{priority}   list, FIFO within a priority
//! q:{cmd}[:{tenant}]:delayed              zset, score = visible-at unix secs
//! q:{cmd}[:{tenant}]:inprog               set of leased ids
//! q:{cmd}[:{tenant}]:dlq                  set of exhausted ids
//! task:{id}                               hash of task fields
//! lease:{id}                              "workerId|leaseUntilUnix"
//! idem:{tenant}:{cmd}:{key}               task id, TTL'd
//! ttl-index                               zset of (id, expiresAtUnix)
//! sub:{id}                                subscription hash
//! subs:{event}                            zset of sub ids, score = expiresAt
//! ```

use crate::common::{SubscriptionId, TaskId};

pub const TTL_INDEX: &str = "ttl-index";

fn queue_base(command: &str, tenant: &str) -> String {
    if tenant.is_empty() {
        format!("q:{command}:")
    } else {
        format!("q:{command}:{tenant}:")
    }
}

pub fn pending(command: &str, tenant: &str, priority: u8) -> String {
    format!("{}pending:{priority}", queue_base(command, tenant))
}

/// Prefix handed to scripts that append the priority digit themselves.
pub fn pending_prefix(command: &str, tenant: &str) -> String {
    format!("{}pending:", queue_base(command, tenant))
}

pub fn delayed(command: &str, tenant: &str) -> String {
    format!("{}delayed", queue_base(command, tenant))
}

pub fn in_progress(command: &str, tenant: &str) -> String {
    format!("{}inprog", queue_base(command, tenant))
}

pub fn dlq(command: &str, tenant: &str) -> String {
    format!("{}dlq", queue_base(command, tenant))
}

pub fn task(id: &TaskId) -> String {
    format!("task:{id}")
}

pub fn lease(id: &TaskId) -> String {
    format!("lease:{id}")
}

pub fn result(id: &TaskId) -> String {
    format!("result:{id}")
}

pub fn idempotency(tenant: &str, command: &str, key: &str) -> String {
    format!("idem:{tenant}:{command}:{key}")
}

pub fn subscription(id: &SubscriptionId) -> String {
    format!("sub:{id}")
}

pub fn subscriptions(event: &str) -> String {
    format!("subs:{event}")
}

/// Fan-out rate-limit window for one subscription. Lives in the KV so the
/// limit holds across replicas.
pub fn notify_window(id: &SubscriptionId) -> String {
    format!("notify:window:{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBucket {
    Pending,
    Delayed,
    InProgress,
    Dlq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeyInfo {
    pub command: String,
    pub tenant: String,
    pub bucket: QueueBucket,
    pub priority: Option<u8>,
}

/// Parse a `q:*` key discovered via SCAN back into its parts.
pub fn parse_queue_key(key: &str) -> Option<QueueKeyInfo> {
    let mut parts = key.split(':');
    if parts.next()? != "q" {
        return None;
    }
    let command = parts.next()?.to_string();
    let rest: Vec<&str> = parts.collect();

    let (tenant, bucket_parts) = match rest.first()? {
        &"pending" | &"delayed" | &"inprog" | &"dlq" => (String::new(), &rest[..]),
        tenant => (tenant.to_string(), &rest[1..]),
    };

    match bucket_parts {
        ["pending", priority] => Some(QueueKeyInfo {
            command,
            tenant,
            bucket: QueueBucket::Pending,
            priority: priority.parse().ok(),
        }),
        ["delayed"] => Some(QueueKeyInfo {
            command,
            tenant,
            bucket: QueueBucket::Delayed,
            priority: None,
        }),
        ["inprog"] => Some(QueueKeyInfo {
            command,
            tenant,
            bucket: QueueBucket::InProgress,
            priority: None,
        }),
        ["dlq"] => Some(QueueKeyInfo {
            command,
            tenant,
            bucket: QueueBucket::Dlq,
            priority: None,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_is_omitted_when_empty() {
        assert_eq!(pending("RENDER", "", 5), "q:RENDER:pending:5");
        assert_eq!(pending("RENDER", "acme", 5), "q:RENDER:acme:pending:5");
        assert_eq!(delayed("RENDER", ""), "q:RENDER:delayed");
        assert_eq!(dlq("RENDER", "acme"), "q:RENDER:acme:dlq");
    }

    #[test]
    fn idempotency_keeps_empty_tenant_slot() {
        assert_eq!(idempotency("", "RENDER", "k1"), "idem::RENDER:k1");
        assert_eq!(idempotency("acme", "RENDER", "k1"), "idem:acme:RENDER:k1");
    }

    #[test]
    fn parses_tenantless_keys() {
        let info = parse_queue_key("q:RENDER:pending:7").unwrap();
        assert_eq!(info.command, "RENDER");
        assert_eq!(info.tenant, "");
        assert_eq!(info.bucket, QueueBucket::Pending);
        assert_eq!(info.priority, Some(7));
    }

    #[test]
    fn parses_tenant_keys() {
        let info = parse_queue_key("q:RENDER:acme:delayed").unwrap();
        assert_eq!(info.tenant, "acme");
        assert_eq!(info.bucket, QueueBucket::Delayed);

        let info = parse_queue_key("q:RENDER:acme:inprog").unwrap();
        assert_eq!(info.bucket, QueueBucket::InProgress);
    }

    #[test]
    fn rejects_foreign_keys() {
        assert!(parse_queue_key("task:01890000").is_none());
        assert!(parse_queue_key("q:RENDER:acme:unknown").is_none());
    }
}
