//! Scheduler service: thin orchestrator over the task repository.
//!
//! Validates inputs, applies defaults, resolves visibility, computes
//! backoff, emits creation events, and exposes the admin views.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::thread_rng;

use crate::common::{QueueError, QueueResult, TaskId};
use crate::config::Config;
use crate::kernel::notifier::Notifier;
use crate::kernel::queue::backoff;
use crate::kernel::queue::repo::{
    ClaimRequest, EnqueueRequest, NackOutcome, QueueAggregate, QueueStats, TaskRepo,
};
use crate::kernel::queue::task::Task;

pub struct CreateTask {
    pub command: String,
    pub payload: serde_json::Value,
    pub priority: Option<i64>,
    pub webhook: Option<String>,
    pub max_attempts: Option<u32>,
    pub idempotency_key: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub delay_seconds: Option<i64>,
}

pub struct ClaimOptions {
    pub commands: Vec<String>,
    pub lease_seconds: Option<u64>,
    pub wait_seconds: Option<u64>,
}

pub struct SchedulerService {
    repo: Arc<TaskRepo>,
    notifier: Arc<Notifier>,
    config: Arc<Config>,
}

impl SchedulerService {
    pub fn new(repo: Arc<TaskRepo>, notifier: Arc<Notifier>, config: Arc<Config>) -> Self {
        Self {
            repo,
            notifier,
            config,
        }
    }

    pub async fn create_task(&self, tenant_id: &str, input: CreateTask) -> QueueResult<Task> {
        if input.command.trim().is_empty() {
            return Err(QueueError::bad_input("command must not be empty"));
        }
        if let Some(webhook) = &input.webhook {
            validate_webhook_url(webhook)?;
        }

        let visible_at = resolve_visible_at(input.run_at, input.delay_seconds, Utc::now())?;
        let priority = clamp_priority(input.priority.unwrap_or(0));
        let max_attempts = input
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);

        let (task, created) = self
            .repo
            .enqueue(EnqueueRequest {
                command: input.command,
                tenant_id: tenant_id.to_string(),
                payload: input.payload,
                priority,
                webhook: input.webhook,
                max_attempts,
                idempotency_key: input.idempotency_key,
                visible_at,
            })
            .await?;

        if created {
            self.notifier.task_created(&task);
        }
        Ok(task)
    }

    /// Claim at most one task, long-polling up to `wait_seconds` in bounded
    /// sleep chunks with a re-scan between each.
    pub async fn claim(
        &self,
        tenant_id: &str,
        worker_id: &str,
        options: ClaimOptions,
    ) -> QueueResult<Option<Task>> {
        let commands = if options.commands.is_empty() {
            self.config.default_commands.clone()
        } else {
            options.commands
        };
        if commands.is_empty() {
            return Err(QueueError::bad_input(
                "no commands requested and no default commands configured",
            ));
        }

        let lease_seconds = options
            .lease_seconds
            .unwrap_or(self.config.default_lease_seconds)
            .max(1);
        let wait = std::time::Duration::from_secs(
            options
                .wait_seconds
                .unwrap_or(0)
                .min(self.config.max_wait_seconds),
        );

        let request = ClaimRequest {
            worker_id,
            tenant_id,
            commands: &commands,
            lease_seconds,
            inspect_limit: self.config.requeue_inspect_limit,
        };

        let started = Instant::now();
        let deadline = started + wait;
        loop {
            if let Some(task) = self.repo.claim_once(&request).await? {
                self.repo
                    .metrics()
                    .claim_wait_seconds
                    .observe(started.elapsed().as_secs_f64());
                return Ok(Some(task));
            }
            let now = Instant::now();
            if now >= deadline {
                self.repo
                    .metrics()
                    .claim_wait_seconds
                    .observe(started.elapsed().as_secs_f64());
                return Ok(None);
            }
            let nap = self.config.claim_poll_interval.min(deadline - now);
            tokio::time::sleep(nap).await;
        }
    }

    pub async fn heartbeat(
        &self,
        tenant_id: &str,
        id: &TaskId,
        worker_id: &str,
        extend_seconds: u64,
    ) -> QueueResult<DateTime<Utc>> {
        self.get_task(tenant_id, id).await?;
        self.repo.heartbeat(id, worker_id, extend_seconds.max(1)).await
    }

    /// Release a claimed task. The effective delay is the greater of the
    /// caller's request and the configured backoff for the task's attempts.
    pub async fn nack(
        &self,
        tenant_id: &str,
        id: &TaskId,
        worker_id: &str,
        delay_seconds: Option<i64>,
        reason: Option<String>,
    ) -> QueueResult<NackOutcome> {
        if delay_seconds.is_some_and(|d| d < 0) {
            return Err(QueueError::bad_input("delaySeconds must not be negative"));
        }
        let task = self.get_task(tenant_id, id).await?;

        let backoff_delay = backoff::delay_seconds(
            self.config.backoff_policy,
            self.config.backoff_base_seconds,
            self.config.backoff_max_seconds,
            task.attempts,
            &mut thread_rng(),
        );
        let effective = delay_seconds.unwrap_or(0).max(backoff_delay);

        self.repo
            .nack(
                &task,
                worker_id,
                effective,
                reason.as_deref().unwrap_or("nacked by worker"),
            )
            .await
    }

    /// Voluntary release: immediate requeue, no backoff penalty.
    pub async fn abandon(
        &self,
        tenant_id: &str,
        id: &TaskId,
        worker_id: &str,
    ) -> QueueResult<NackOutcome> {
        let task = self.get_task(tenant_id, id).await?;
        self.repo.nack(&task, worker_id, 0, "abandoned").await
    }

    pub async fn get_task(&self, tenant_id: &str, id: &TaskId) -> QueueResult<Task> {
        let task = self.repo.get(id).await?;
        if task.tenant_id != tenant_id {
            return Err(QueueError::NotFound("task"));
        }
        Ok(task)
    }

    pub async fn queue_stats(&self, command: &str, tenant_id: &str) -> QueueResult<QueueStats> {
        self.repo.queue_stats(command, tenant_id).await
    }

    pub async fn admin_queues(&self) -> QueueResult<Vec<QueueAggregate>> {
        self.repo.admin_queues().await
    }

    pub async fn cleanup(&self, limit: usize, before: DateTime<Utc>) -> QueueResult<u64> {
        self.repo.cleanup_expired(limit, before).await
    }
}

fn clamp_priority(priority: i64) -> u8 {
    priority.clamp(0, 9) as u8
}

fn validate_webhook_url(url: &str) -> QueueResult<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| QueueError::bad_input("webhook must be a valid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(QueueError::bad_input("webhook must be http or https"));
    }
    Ok(())
}

/// Resolve `runAt` / `delaySeconds` into an absolute visibility timestamp.
/// The two are mutually exclusive; a negative delay is rejected.
fn resolve_visible_at(
    run_at: Option<DateTime<Utc>>,
    delay_seconds: Option<i64>,
    now: DateTime<Utc>,
) -> QueueResult<Option<DateTime<Utc>>> {
    match (run_at, delay_seconds) {
        (Some(_), Some(_)) => Err(QueueError::bad_input(
            "runAt and delaySeconds are mutually exclusive",
        )),
        (Some(at), None) => Ok(Some(at)),
        (None, Some(delay)) if delay < 0 => {
            Err(QueueError::bad_input("delaySeconds must not be negative"))
        }
        (None, Some(0)) => Ok(None),
        (None, Some(delay)) => Ok(Some(now + chrono::Duration::seconds(delay))),
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn priority_is_clamped_into_buckets() {
        assert_eq!(clamp_priority(-3), 0);
        assert_eq!(clamp_priority(0), 0);
        assert_eq!(clamp_priority(9), 9);
        assert_eq!(clamp_priority(42), 9);
    }

    #[test]
    fn visible_at_resolution() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        assert_eq!(resolve_visible_at(None, None, now).unwrap(), None);
        assert_eq!(resolve_visible_at(None, Some(0), now).unwrap(), None);
        assert_eq!(
            resolve_visible_at(None, Some(30), now).unwrap(),
            Some(now + chrono::Duration::seconds(30))
        );

        let at = now + chrono::Duration::seconds(90);
        assert_eq!(resolve_visible_at(Some(at), None, now).unwrap(), Some(at));

        assert!(resolve_visible_at(None, Some(-1), now).is_err());
        assert!(resolve_visible_at(Some(at), Some(5), now).is_err());
    }

    #[test]
    fn webhook_urls_must_be_http() {
        assert!(validate_webhook_url("https://example.com/hook").is_ok());
        assert!(validate_webhook_url("http://10.0.0.5/hook").is_ok());
        assert!(validate_webhook_url("ftp://example.com").is_err());
        assert!(validate_webhook_url("not a url").is_err());
    }
}
