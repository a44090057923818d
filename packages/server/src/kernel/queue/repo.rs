//! KV-backed task repository.
//!
//! Owns the queue key layout, task hashes, idempotency and lease indices.
//! Every multi-key transition goes through one of the scripts in
//! [`super::scripts`]; this module supplies the claim scan order, the
//! process-local bloom fast paths, and claim-time lease repair.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::Value;
use serde::Serialize;
use tracing::{debug, warn};

use crate::common::bloom::RotatingBloom;
use crate::common::{QueueError, QueueResult, TaskId};
use crate::config::{Config, PriorityScan};
use crate::kernel::kv::{reply_int, reply_string, Kv};
use crate::kernel::metrics::QueueMetrics;
use crate::kernel::queue::keys::{self, QueueBucket};
use crate::kernel::queue::scripts::ScriptSet;
use crate::kernel::queue::task::{Task, TaskStatus};

pub struct EnqueueRequest {
    pub command: String,
    pub tenant_id: String,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub webhook: Option<String>,
    pub max_attempts: u32,
    pub idempotency_key: Option<String>,
    pub visible_at: Option<DateTime<Utc>>,
}

pub struct ClaimRequest<'a> {
    pub worker_id: &'a str,
    pub tenant_id: &'a str,
    pub commands: &'a [String],
    pub lease_seconds: u64,
    pub inspect_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackOutcome {
    pub delay_seconds: i64,
    pub moved_to_dlq: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub ready: u64,
    pub delayed: u64,
    pub in_progress: u64,
    pub dlq: u64,
}

/// One aggregate row of the admin queue view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueAggregate {
    pub command: String,
    pub tenant_id: String,
    #[serde(flatten)]
    pub stats: QueueStats,
}

struct Tuning {
    default_max_attempts: u32,
    idempotency_ttl_seconds: u64,
    task_ttl_seconds: u64,
}

pub struct TaskRepo {
    kv: Kv,
    scripts: Arc<ScriptSet>,
    tuning: Tuning,
    scan: PriorityScan,
    idem_bloom: RotatingBloom,
    ghost_bloom: RotatingBloom,
    cleanup_bloom: RotatingBloom,
    metrics: Arc<QueueMetrics>,
}

impl TaskRepo {
    pub fn new(
        kv: Kv,
        scripts: Arc<ScriptSet>,
        config: &Config,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        Self {
            kv,
            scripts,
            tuning: Tuning {
                default_max_attempts: config.default_max_attempts,
                idempotency_ttl_seconds: config.idempotency_ttl_seconds,
                task_ttl_seconds: config.task_ttl_seconds,
            },
            scan: config.priority_scan,
            idem_bloom: RotatingBloom::new(config.idempotency_bloom.clone()),
            ghost_bloom: RotatingBloom::new(config.ghost_bloom.clone()),
            cleanup_bloom: RotatingBloom::new(config.cleanup_bloom.clone()),
            metrics,
        }
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    pub async fn get(&self, id: &TaskId) -> QueueResult<Task> {
        let mut conn = self.kv.conn();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(keys::task(id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Err(QueueError::NotFound("task"));
        }
        Task::from_hash(&map)
    }

    /// Persist and queue a task atomically. Returns `(task, created)`;
    /// `created == false` means an idempotency record won and the prior
    /// task was adopted.
    pub async fn enqueue(&self, req: EnqueueRequest) -> QueueResult<(Task, bool)> {
        let now = Utc::now();
        let idem_key = req
            .idempotency_key
            .as_deref()
            .map(|k| keys::idempotency(&req.tenant_id, &req.command, k));

        // Bloom-negative means definitely unseen, so the GET is skipped.
        if let Some(idem_key) = &idem_key {
            if self.idem_bloom.contains(idem_key) {
                let mut conn = self.kv.conn();
                let existing: Option<String> = redis::cmd("GET")
                    .arg(idem_key)
                    .query_async(&mut conn)
                    .await?;
                if let Some(existing) = existing {
                    let id = parse_task_id(&existing)?;
                    return Ok((self.get(&id).await?, false));
                }
            }
        }

        let visible_at = req
            .visible_at
            .filter(|at| *at > now)
            .map(|at| at.timestamp())
            .unwrap_or(0);

        let task = Task {
            id: TaskId::new(),
            command: req.command,
            tenant_id: req.tenant_id,
            payload: req.payload,
            priority: req.priority.min(9),
            webhook: req.webhook,
            max_attempts: req.max_attempts,
            status: TaskStatus::Pending,
            worker_id: None,
            lease_until: None,
            attempts: 0,
            error: None,
            result_key: None,
            created_at: now,
            updated_at: now,
        };

        let destination = if visible_at > 0 {
            keys::delayed(&task.command, &task.tenant_id)
        } else {
            keys::pending(&task.command, &task.tenant_id, task.priority)
        };
        let task_key = keys::task(&task.id);

        let mut args = vec![
            task.id.to_string(),
            if idem_key.is_some() { "1" } else { "0" }.to_string(),
            self.tuning.idempotency_ttl_seconds.to_string(),
            visible_at.to_string(),
            (now.timestamp() + self.tuning.task_ttl_seconds as i64).to_string(),
        ];
        for (field, value) in task.hash_fields() {
            args.push(field.to_string());
            args.push(value);
        }

        let script_keys = vec![
            task_key.clone(),
            destination,
            keys::TTL_INDEX.to_string(),
            idem_key.clone().unwrap_or(task_key),
        ];

        let reply: Vec<Value> = self
            .kv
            .script(&self.scripts.enqueue, &script_keys, &args)
            .await?;

        if let Some(idem_key) = &idem_key {
            self.idem_bloom.insert(idem_key);
        }

        match reply_int(&reply, 0)? {
            // Lost the race; adopt the winner's task.
            0 => {
                let existing = reply_string(&reply, 1)?
                    .ok_or_else(|| anyhow::anyhow!("enqueue script returned no winner id"))?;
                let id = parse_task_id(&existing)?;
                Ok((self.get(&id).await?, false))
            }
            _ => {
                self.metrics
                    .tasks_enqueued
                    .with_label_values(&[task.command.as_str()])
                    .inc();
                Ok((task, true))
            }
        }
    }

    /// One pass over the requested commands in priority-scan order. Lease
    /// repair for each command's in-progress set is amortized into this
    /// path before its pending lists are popped.
    pub async fn claim_once(&self, req: &ClaimRequest<'_>) -> QueueResult<Option<Task>> {
        for command in req.commands {
            self.repair_expired(command, req.tenant_id, req.inspect_limit)
                .await?;

            let in_progress = keys::in_progress(command, req.tenant_id);
            for priority in self.scan.buckets() {
                let pending = keys::pending(command, req.tenant_id, priority);
                if let Some(task) = self
                    .claim_from(&pending, &in_progress, req.worker_id, req.lease_seconds)
                    .await?
                {
                    self.metrics
                        .tasks_claimed
                        .with_label_values(&[command.as_str()])
                        .inc();
                    return Ok(Some(task));
                }
            }
        }
        Ok(None)
    }

    async fn claim_from(
        &self,
        pending: &str,
        in_progress: &str,
        worker_id: &str,
        lease_seconds: u64,
    ) -> QueueResult<Option<Task>> {
        loop {
            let now = Utc::now().timestamp();
            let script_keys = vec![pending.to_string(), in_progress.to_string()];
            let args = vec![
                worker_id.to_string(),
                now.to_string(),
                (now + lease_seconds as i64).to_string(),
            ];
            let reply: Vec<Value> = self
                .kv
                .script(&self.scripts.claim_pop, &script_keys, &args)
                .await?;

            match reply_int(&reply, 0)? {
                0 => return Ok(None),
                // Popped id had no hash; remember it and keep scanning.
                2 => {
                    if let Some(id) = reply_string(&reply, 1)? {
                        self.ghost_bloom.insert(&id);
                        self.metrics.ghosts_skipped.inc();
                    }
                    continue;
                }
                _ => {
                    let id = reply_string(&reply, 1)?
                        .ok_or_else(|| anyhow::anyhow!("claim script returned no id"))?;

                    // Ghost fast path: skip the hash fetch entirely.
                    if self.ghost_bloom.contains(&id) {
                        self.purge_residuals(in_progress, &id).await?;
                        self.metrics.ghosts_skipped.inc();
                        continue;
                    }

                    let task_id = parse_task_id(&id)?;
                    let mut conn = self.kv.conn();
                    let map: HashMap<String, String> = redis::cmd("HGETALL")
                        .arg(keys::task(&task_id))
                        .query_async(&mut conn)
                        .await?;
                    if map.is_empty() {
                        self.ghost_bloom.insert(&id);
                        self.purge_residuals(in_progress, &id).await?;
                        self.metrics.ghosts_skipped.inc();
                        continue;
                    }
                    return Ok(Some(Task::from_hash(&map)?));
                }
            }
        }
    }

    async fn purge_residuals(&self, in_progress: &str, id: &str) -> QueueResult<()> {
        let _: i64 = self
            .kv
            .script(
                &self.scripts.purge_residuals,
                &[in_progress.to_string()],
                &[id.to_string()],
            )
            .await?;
        Ok(())
    }

    /// Inspect up to `limit` members of the command's in-progress set and
    /// re-queue (or dead-letter) those whose lease has lapsed.
    async fn repair_expired(&self, command: &str, tenant: &str, limit: usize) -> QueueResult<()> {
        if limit == 0 {
            return Ok(());
        }
        let in_progress = keys::in_progress(command, tenant);

        let mut conn = self.kv.conn();
        let candidates: Vec<String> = redis::cmd("SRANDMEMBER")
            .arg(&in_progress)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for id in &candidates {
            pipe.cmd("GET").arg(format!("lease:{id}"));
        }
        let leases: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        let now = Utc::now().timestamp();
        let script_keys = vec![in_progress, keys::dlq(command, tenant)];
        for (id, lease) in candidates.iter().zip(leases) {
            if lease_is_live(lease.as_deref(), now) {
                continue;
            }
            let args = vec![
                id.clone(),
                now.to_string(),
                self.tuning.default_max_attempts.to_string(),
                keys::pending_prefix(command, tenant),
            ];
            let reply: Vec<Value> = self
                .kv
                .script(&self.scripts.requeue_expired, &script_keys, &args)
                .await?;
            match reply_int(&reply, 0)? {
                1 => {
                    debug!(task_id = %id, command, "expired lease re-queued");
                    self.metrics
                        .leases_repaired
                        .with_label_values(&["requeued"])
                        .inc();
                }
                2 => {
                    warn!(task_id = %id, command, "expired lease dead-lettered");
                    self.metrics
                        .leases_repaired
                        .with_label_values(&["dlq"])
                        .inc();
                    self.metrics
                        .tasks_dead_lettered
                        .with_label_values(&[command])
                        .inc();
                }
                3 => self.ghost_bloom.insert(id),
                _ => {}
            }
        }
        Ok(())
    }

    /// Extend the caller's lease. Fails `not-owner` when the lease is held
    /// by someone else or no longer exists.
    pub async fn heartbeat(
        &self,
        id: &TaskId,
        worker_id: &str,
        extend_seconds: u64,
    ) -> QueueResult<DateTime<Utc>> {
        let now = Utc::now();
        let lease_until = now.timestamp() + extend_seconds as i64;
        let script_keys = vec![keys::lease(id), keys::task(id)];
        let args = vec![
            worker_id.to_string(),
            now.timestamp().to_string(),
            lease_until.to_string(),
        ];
        let reply: Vec<Value> = self
            .kv
            .script(&self.scripts.heartbeat, &script_keys, &args)
            .await?;
        match reply_int(&reply, 0)? {
            1 => Ok(DateTime::from_timestamp(lease_until, 0)
                .unwrap_or_else(Utc::now)),
            _ => Err(QueueError::NotOwner),
        }
    }

    /// Release the task back to the queue with `delay_seconds`, or to the
    /// DLQ once attempts are exhausted. The effective delay is decided by
    /// the caller (max of requested delay and backoff).
    pub async fn nack(
        &self,
        task: &Task,
        worker_id: &str,
        delay_seconds: i64,
        reason: &str,
    ) -> QueueResult<NackOutcome> {
        let now = Utc::now().timestamp();
        let script_keys = vec![
            keys::lease(&task.id),
            keys::task(&task.id),
            keys::in_progress(&task.command, &task.tenant_id),
            keys::dlq(&task.command, &task.tenant_id),
            keys::delayed(&task.command, &task.tenant_id),
        ];
        let args = vec![
            worker_id.to_string(),
            now.to_string(),
            delay_seconds.max(0).to_string(),
            self.tuning.default_max_attempts.to_string(),
            reason.to_string(),
            keys::pending_prefix(&task.command, &task.tenant_id),
            task.id.to_string(),
        ];
        let reply: Vec<Value> = self
            .kv
            .script(&self.scripts.nack, &script_keys, &args)
            .await?;
        match reply_int(&reply, 0)? {
            1 => {
                let delay = reply_int(&reply, 1)?;
                self.metrics
                    .tasks_nacked
                    .with_label_values(&[task.command.as_str(), "requeued"])
                    .inc();
                Ok(NackOutcome {
                    delay_seconds: delay,
                    moved_to_dlq: false,
                })
            }
            2 => {
                self.metrics
                    .tasks_nacked
                    .with_label_values(&[task.command.as_str(), "dlq"])
                    .inc();
                self.metrics
                    .tasks_dead_lettered
                    .with_label_values(&[task.command.as_str()])
                    .inc();
                Ok(NackOutcome {
                    delay_seconds: 0,
                    moved_to_dlq: true,
                })
            }
            _ => Err(QueueError::NotOwner),
        }
    }

    /// Current lease holder, if any.
    pub async fn lease_owner(&self, id: &TaskId) -> QueueResult<Option<String>> {
        let mut conn = self.kv.conn();
        let lease: Option<String> = redis::cmd("GET")
            .arg(keys::lease(id))
            .query_async(&mut conn)
            .await?;
        Ok(lease.and_then(|l| l.split('|').next().map(str::to_string)))
    }

    /// Move due entries of one delayed index into their pending lists.
    pub async fn move_due_delayed(
        &self,
        command: &str,
        tenant: &str,
        limit: usize,
    ) -> QueueResult<usize> {
        let delayed = keys::delayed(command, tenant);
        let now = Utc::now().timestamp();

        let mut conn = self.kv.conn();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        let mut moved = 0;
        for id in due {
            // Ids deleted by cleanup never come back; other replicas rely
            // on the HEXISTS guard inside the script.
            if self.ghost_bloom.contains(&id) {
                let _: i64 = redis::cmd("ZREM")
                    .arg(&delayed)
                    .arg(&id)
                    .query_async(&mut conn)
                    .await?;
                continue;
            }
            let disc: i64 = self
                .kv
                .script(
                    &self.scripts.promote_one,
                    &[delayed.clone()],
                    &[id.clone(), keys::pending_prefix(command, tenant)],
                )
                .await?;
            if disc == 1 {
                moved += 1;
            } else if disc == 2 {
                self.ghost_bloom.insert(&id);
            }
        }

        if moved > 0 {
            self.metrics
                .delayed_promoted
                .with_label_values(&[command])
                .inc_by(moved as u64);
        }
        Ok(moved)
    }

    /// Purge tasks whose ttl-index entry expired before `before`. Returns
    /// the number of hashes deleted.
    pub async fn cleanup_expired(
        &self,
        limit: usize,
        before: DateTime<Utc>,
    ) -> QueueResult<u64> {
        let mut conn = self.kv.conn();
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(keys::TTL_INDEX)
            .arg("-inf")
            .arg(before.timestamp())
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        let mut deleted = 0;
        for id in expired {
            // A concurrent janitor already handled this id; just drop the
            // index entry.
            if self.cleanup_bloom.contains(&id) {
                let _: i64 = redis::cmd("ZREM")
                    .arg(keys::TTL_INDEX)
                    .arg(&id)
                    .query_async(&mut conn)
                    .await?;
                continue;
            }
            let _: i64 = self
                .kv
                .script(
                    &self.scripts.cleanup_task,
                    &[keys::TTL_INDEX.to_string()],
                    &[id.clone()],
                )
                .await?;
            self.cleanup_bloom.insert(&id);
            self.ghost_bloom.insert(&id);
            deleted += 1;
        }

        if deleted > 0 {
            self.metrics.tasks_cleaned.inc_by(deleted);
        }
        Ok(deleted)
    }

    /// Ready/delayed/in-progress/dlq counts for one (command, tenant).
    pub async fn queue_stats(&self, command: &str, tenant: &str) -> QueueResult<QueueStats> {
        let mut conn = self.kv.conn();
        let mut pipe = redis::pipe();
        for priority in 0..=9u8 {
            pipe.cmd("LLEN").arg(keys::pending(command, tenant, priority));
        }
        pipe.cmd("ZCARD").arg(keys::delayed(command, tenant));
        pipe.cmd("SCARD").arg(keys::in_progress(command, tenant));
        pipe.cmd("SCARD").arg(keys::dlq(command, tenant));

        let counts: Vec<u64> = pipe.query_async(&mut conn).await?;
        let ready = counts.iter().take(10).sum();
        Ok(QueueStats {
            ready,
            delayed: counts.get(10).copied().unwrap_or(0),
            in_progress: counts.get(11).copied().unwrap_or(0),
            dlq: counts.get(12).copied().unwrap_or(0),
        })
    }

    /// Aggregate counts per (command, tenant) across every queue key in
    /// the store.
    pub async fn admin_queues(&self) -> QueueResult<Vec<QueueAggregate>> {
        let queue_keys = self.scan_queue_keys().await?;

        let mut aggregates: HashMap<(String, String), QueueStats> = HashMap::new();
        let mut conn = self.kv.conn();
        for chunk in queue_keys.chunks(64) {
            let mut pipe = redis::pipe();
            let mut parsed = Vec::with_capacity(chunk.len());
            for key in chunk {
                let Some(info) = keys::parse_queue_key(key) else {
                    continue;
                };
                match info.bucket {
                    QueueBucket::Pending => pipe.cmd("LLEN").arg(key),
                    QueueBucket::Delayed => pipe.cmd("ZCARD").arg(key),
                    QueueBucket::InProgress | QueueBucket::Dlq => pipe.cmd("SCARD").arg(key),
                };
                parsed.push(info);
            }
            let counts: Vec<u64> = pipe.query_async(&mut conn).await?;
            for (info, count) in parsed.into_iter().zip(counts) {
                let entry = aggregates
                    .entry((info.command, info.tenant))
                    .or_default();
                match info.bucket {
                    QueueBucket::Pending => entry.ready += count,
                    QueueBucket::Delayed => entry.delayed += count,
                    QueueBucket::InProgress => entry.in_progress += count,
                    QueueBucket::Dlq => entry.dlq += count,
                }
            }
        }

        let mut rows: Vec<QueueAggregate> = aggregates
            .into_iter()
            .map(|((command, tenant_id), stats)| QueueAggregate {
                command,
                tenant_id,
                stats,
            })
            .collect();
        rows.sort_by(|a, b| (&a.command, &a.tenant_id).cmp(&(&b.command, &b.tenant_id)));
        Ok(rows)
    }

    /// Every (command, tenant) pair that currently has a delayed index.
    pub async fn delayed_queues(&self) -> QueueResult<Vec<(String, String)>> {
        let queue_keys = self.scan_queue_keys().await?;
        let mut found = Vec::new();
        for key in queue_keys {
            if let Some(info) = keys::parse_queue_key(&key) {
                if info.bucket == QueueBucket::Delayed {
                    found.push((info.command, info.tenant));
                }
            }
        }
        found.sort();
        found.dedup();
        Ok(found)
    }

    async fn scan_queue_keys(&self) -> QueueResult<Vec<String>> {
        let mut conn = self.kv.conn();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("q:*")
                .arg("COUNT")
                .arg(512)
                .query_async(&mut conn)
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(found)
    }
}

fn lease_is_live(lease: Option<&str>, now: i64) -> bool {
    let Some(lease) = lease else {
        return false;
    };
    lease
        .split_once('|')
        .and_then(|(_, until)| until.parse::<i64>().ok())
        .map(|until| until >= now)
        .unwrap_or(false)
}

fn parse_task_id(raw: &str) -> QueueResult<TaskId> {
    raw.parse()
        .map_err(|e| QueueError::Internal(anyhow::anyhow!("malformed task id {raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_liveness() {
        assert!(!lease_is_live(None, 100));
        assert!(!lease_is_live(Some("w1|50"), 100));
        assert!(lease_is_live(Some("w1|100"), 100));
        assert!(lease_is_live(Some("w1|150"), 100));
        assert!(!lease_is_live(Some("garbage"), 100));
    }

    #[test]
    fn queue_stats_serializes_camel_case() {
        let stats = QueueStats {
            ready: 1,
            delayed: 2,
            in_progress: 3,
            dlq: 4,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["inProgress"], 3);
        assert_eq!(json["dlq"], 4);
    }
}
