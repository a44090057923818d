//! Background sweeper loops.
//!
//! Three loops per replica: delayed-promotion, subscription cleanup, and
//! ttl cleanup, plus a queue-depth sampler for the metrics endpoint. Each
//! cycle logs and continues on error; a failed cycle never aborts the next.
//! Cancellation is cooperative via the process shutdown token.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::kernel::metrics::QueueMetrics;
use crate::kernel::queue::repo::TaskRepo;
use crate::kernel::subscriptions::SubscriptionRepo;

const DEPTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

pub fn spawn_all(
    repo: Arc<TaskRepo>,
    subscriptions: Arc<SubscriptionRepo>,
    metrics: Arc<QueueMetrics>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_loop(
            "delayed-promoter",
            config.promote_interval,
            shutdown.clone(),
            {
                let repo = Arc::clone(&repo);
                let batch = config.promote_batch;
                move || {
                    let repo = Arc::clone(&repo);
                    async move { promote_due(&repo, batch).await }
                }
            },
        ),
        spawn_loop(
            "subscription-sweeper",
            config.subscription_sweep_interval,
            shutdown.clone(),
            {
                let subscriptions = Arc::clone(&subscriptions);
                let batch = config.subscription_sweep_batch;
                move || {
                    let subscriptions = Arc::clone(&subscriptions);
                    async move {
                        let removed = subscriptions.sweep(Utc::now(), batch).await?;
                        if removed > 0 {
                            debug!(removed, "stale subscriptions swept");
                        }
                        Ok(())
                    }
                }
            },
        ),
        spawn_loop(
            "ttl-cleanup",
            config.cleanup_interval,
            shutdown.clone(),
            {
                let repo = Arc::clone(&repo);
                let batch = config.cleanup_batch;
                move || {
                    let repo = Arc::clone(&repo);
                    async move {
                        let deleted = repo.cleanup_expired(batch, Utc::now()).await?;
                        if deleted > 0 {
                            info!(deleted, "expired tasks purged");
                        }
                        Ok(())
                    }
                }
            },
        ),
        spawn_loop("depth-sampler", DEPTH_SAMPLE_INTERVAL, shutdown, {
            move || {
                let repo = Arc::clone(&repo);
                let metrics = Arc::clone(&metrics);
                async move { sample_depths(&repo, &metrics).await }
            }
        }),
    ]
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown: CancellationToken,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(sweeper = name, interval_secs = interval.as_secs_f64(), "sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = cycle().await {
                        error!(sweeper = name, error = %e, "sweep cycle failed");
                    }
                }
            }
        }
        info!(sweeper = name, "sweeper stopped");
    })
}

async fn promote_due(repo: &TaskRepo, batch: usize) -> anyhow::Result<()> {
    for (command, tenant) in repo.delayed_queues().await? {
        let moved = repo.move_due_delayed(&command, &tenant, batch).await?;
        if moved > 0 {
            debug!(command, tenant, moved, "delayed tasks promoted");
        }
    }
    Ok(())
}

async fn sample_depths(repo: &TaskRepo, metrics: &QueueMetrics) -> anyhow::Result<()> {
    for row in repo.admin_queues().await? {
        let set = |bucket: &str, value: u64| {
            metrics
                .queue_depth
                .with_label_values(&[row.command.as_str(), row.tenant_id.as_str(), bucket])
                .set(value as i64);
        };
        set("pending", row.stats.ready);
        set("delayed", row.stats.delayed);
        set("inprog", row.stats.in_progress);
        set("dlq", row.stats.dlq);
    }
    Ok(())
}
