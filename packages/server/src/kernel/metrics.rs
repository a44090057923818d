//! Prometheus metrics for the queue engine and webhook channels.

use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

pub struct QueueMetrics {
    registry: Registry,

    pub tasks_enqueued: IntCounterVec,
    pub tasks_claimed: IntCounterVec,
    pub tasks_nacked: IntCounterVec,
    pub tasks_dead_lettered: IntCounterVec,
    pub tasks_completed: IntCounterVec,
    pub leases_repaired: IntCounterVec,
    pub delayed_promoted: IntCounterVec,
    pub ghosts_skipped: IntCounter,
    pub tasks_cleaned: IntCounter,
    pub queue_depth: IntGaugeVec,
    pub claim_wait_seconds: Histogram,
    pub webhook_deliveries: IntCounterVec,
    pub webhook_latency_seconds: HistogramVec,
}

impl QueueMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tasks_enqueued = IntCounterVec::new(
            Opts::new("codeq_tasks_enqueued_total", "Tasks accepted for queueing"),
            &["command"],
        )?;
        let tasks_claimed = IntCounterVec::new(
            Opts::new("codeq_tasks_claimed_total", "Tasks handed to workers"),
            &["command"],
        )?;
        let tasks_nacked = IntCounterVec::new(
            Opts::new("codeq_tasks_nacked_total", "Nack outcomes"),
            &["command", "outcome"],
        )?;
        let tasks_dead_lettered = IntCounterVec::new(
            Opts::new("codeq_tasks_dead_lettered_total", "Tasks moved to the DLQ"),
            &["command"],
        )?;
        let tasks_completed = IntCounterVec::new(
            Opts::new("codeq_tasks_completed_total", "Terminal results stored"),
            &["command", "status"],
        )?;
        let leases_repaired = IntCounterVec::new(
            Opts::new(
                "codeq_leases_repaired_total",
                "Expired leases recovered on the claim path",
            ),
            &["outcome"],
        )?;
        let delayed_promoted = IntCounterVec::new(
            Opts::new(
                "codeq_delayed_promoted_total",
                "Delayed tasks made visible",
            ),
            &["command"],
        )?;
        let ghosts_skipped = IntCounter::new(
            "codeq_ghosts_skipped_total",
            "Claims that skipped a deleted task id",
        )?;
        let tasks_cleaned = IntCounter::new(
            "codeq_tasks_cleaned_total",
            "Task hashes purged by ttl cleanup",
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("codeq_queue_depth", "Sampled queue collection sizes"),
            &["command", "tenant", "bucket"],
        )?;
        let claim_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "codeq_claim_wait_seconds",
                "Time a claim call spent long-polling",
            )
            .buckets(vec![0.0, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        )?;
        let webhook_deliveries = IntCounterVec::new(
            Opts::new("codeq_webhook_deliveries_total", "Webhook POST outcomes"),
            &["channel", "outcome"],
        )?;
        let webhook_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "codeq_webhook_latency_seconds",
                "Webhook POST round-trip time",
            ),
            &["channel"],
        )?;

        registry.register(Box::new(tasks_enqueued.clone()))?;
        registry.register(Box::new(tasks_claimed.clone()))?;
        registry.register(Box::new(tasks_nacked.clone()))?;
        registry.register(Box::new(tasks_dead_lettered.clone()))?;
        registry.register(Box::new(tasks_completed.clone()))?;
        registry.register(Box::new(leases_repaired.clone()))?;
        registry.register(Box::new(delayed_promoted.clone()))?;
        registry.register(Box::new(ghosts_skipped.clone()))?;
        registry.register(Box::new(tasks_cleaned.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(claim_wait_seconds.clone()))?;
        registry.register(Box::new(webhook_deliveries.clone()))?;
        registry.register(Box::new(webhook_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            tasks_enqueued,
            tasks_claimed,
            tasks_nacked,
            tasks_dead_lettered,
            tasks_completed,
            leases_repaired,
            delayed_promoted,
            ghosts_skipped,
            tasks_cleaned,
            queue_depth,
            claim_wait_seconds,
            webhook_deliveries,
            webhook_latency_seconds,
        })
    }

    /// Text exposition for `GET /metrics`.
    pub fn export(&self) -> Result<String> {
        let mut out = String::new();
        TextEncoder::new().encode_utf8(&self.registry.gather(), &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_exports() {
        let metrics = QueueMetrics::new().unwrap();
        metrics.tasks_enqueued.with_label_values(&["RENDER"]).inc();
        metrics
            .webhook_deliveries
            .with_label_values(&["notifier", "ok"])
            .inc();

        let text = metrics.export().unwrap();
        assert!(text.contains("codeq_tasks_enqueued_total"));
        assert!(text.contains("codeq_webhook_deliveries_total"));
    }
}
