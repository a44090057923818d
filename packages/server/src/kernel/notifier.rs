//! Creation fan-out.
//!
//! On every successful enqueue a background dispatch POSTs the signed
//! creation event to every active subscription matching the task's command
//! (or the wildcard). Delivery is fire-and-forget over a bounded worker
//! pool; a per-subscription window limiter in the KV drops events beyond
//! one per `minIntervalSeconds`. Subscriptions are advisory: no retries,
//! no persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::kernel::events::CreationEvent;
use crate::kernel::kv::Kv;
use crate::kernel::metrics::QueueMetrics;
use crate::kernel::queue::keys;
use crate::kernel::queue::task::Task;
use crate::kernel::subscriptions::{DeliveryMode, Subscription, SubscriptionRepo};
use crate::kernel::webhook;

pub struct Notifier {
    subscriptions: Arc<SubscriptionRepo>,
    kv: Kv,
    http: reqwest::Client,
    secret: Option<Vec<u8>>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    enabled: bool,
    metrics: Arc<QueueMetrics>,
}

impl Notifier {
    pub fn new(
        subscriptions: Arc<SubscriptionRepo>,
        kv: Kv,
        config: &Config,
        metrics: Arc<QueueMetrics>,
    ) -> Self {
        Self {
            subscriptions,
            kv,
            http: reqwest::Client::new(),
            secret: config.webhook_secret.as_ref().map(|s| s.as_bytes().to_vec()),
            permits: Arc::new(Semaphore::new(config.notifier_pool_size.max(1))),
            timeout: config.webhook_timeout,
            enabled: config.webhooks_enabled,
            metrics,
        }
    }

    /// Fire-and-forget dispatch; never fails the originating request.
    pub fn task_created(self: &Arc<Self>, task: &Task) {
        if !self.enabled {
            return;
        }
        let notifier = Arc::clone(self);
        let task = task.clone();
        tokio::spawn(async move {
            if let Err(error) = notifier.fan_out(task).await {
                warn!(%error, "creation fan-out failed");
            }
        });
    }

    async fn fan_out(&self, task: Task) -> Result<()> {
        let now = Utc::now();
        let mut subs = self.subscriptions.list_active(&task.command, now).await?;
        subs.extend(self.subscriptions.list_active("*", now).await?);

        let deliveries = select_deliveries(subs);
        if deliveries.is_empty() {
            return Ok(());
        }

        let body = serde_json::to_vec(&CreationEvent::new(&task))?;
        let signature = self.secret.as_deref().map(|s| webhook::sign(s, &body));

        for sub in deliveries {
            if !self.acquire_window(&sub).await {
                debug!(subscription_id = %sub.id, command = %task.command, "fan-out window closed, dropping event");
                self.metrics
                    .webhook_deliveries
                    .with_label_values(&["notifier", "throttled"])
                    .inc();
                continue;
            }

            let permit = Arc::clone(&self.permits).acquire_owned().await?;
            let http = self.http.clone();
            let body = body.clone();
            let signature = signature.clone();
            let timeout = self.timeout;
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                let _permit = permit;
                send_one(http, sub, body, signature, timeout, metrics).await;
            });
        }
        Ok(())
    }

    /// At most one delivery per window. The window key lives in the KV so
    /// the limit holds across replicas; errors fail open (a dropped event
    /// is worse than a double send on an advisory channel).
    async fn acquire_window(&self, sub: &Subscription) -> bool {
        if sub.min_interval_seconds == 0 {
            return true;
        }
        let mut conn = self.kv.conn();
        let outcome: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(keys::notify_window(&sub.id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(sub.min_interval_seconds)
            .query_async(&mut conn)
            .await;
        match outcome {
            Ok(reply) => reply.is_some(),
            Err(error) => {
                warn!(%error, subscription_id = %sub.id, "rate-limit window check failed");
                true
            }
        }
    }
}

/// Collapse the subscription list per the delivery modes: `fanout` subs all
/// deliver, `group` subs deliver once per group (lowest id wins, which is
/// stable across replicas). Duplicates from the wildcard set are dropped.
fn select_deliveries(subs: Vec<Subscription>) -> Vec<Subscription> {
    let mut seen = std::collections::HashSet::new();
    let mut fanout = Vec::new();
    let mut groups: HashMap<String, Subscription> = HashMap::new();

    for sub in subs {
        if !seen.insert(sub.id) {
            continue;
        }
        match (sub.delivery_mode, sub.group_id.clone()) {
            (DeliveryMode::Group, Some(group)) => match groups.entry(group) {
                std::collections::hash_map::Entry::Occupied(mut held) => {
                    if sub.id < held.get().id {
                        held.insert(sub);
                    }
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(sub);
                }
            },
            _ => fanout.push(sub),
        }
    }

    fanout.extend(groups.into_values());
    fanout
}

async fn send_one(
    http: reqwest::Client,
    sub: Subscription,
    body: Vec<u8>,
    signature: Option<String>,
    timeout: Duration,
    metrics: Arc<QueueMetrics>,
) {
    let started = std::time::Instant::now();
    let mut request = http
        .post(&sub.callback_url)
        .header(CONTENT_TYPE, "application/json")
        .timeout(timeout)
        .body(body);
    if let Some(signature) = signature {
        request = request.header(webhook::SIGNATURE_HEADER, signature);
    }

    let outcome = match request.send().await {
        Ok(response) if response.status().is_success() => "ok",
        Ok(response) => {
            debug!(subscription_id = %sub.id, status = %response.status(), "fan-out rejected");
            "rejected"
        }
        Err(error) => {
            debug!(subscription_id = %sub.id, %error, "fan-out failed");
            "error"
        }
    };
    metrics
        .webhook_deliveries
        .with_label_values(&["notifier", outcome])
        .inc();
    metrics
        .webhook_latency_seconds
        .with_label_values(&["notifier"])
        .observe(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SubscriptionId;

    fn sub(mode: DeliveryMode, group: Option<&str>) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            callback_url: "https://example.com/hook".to_string(),
            event_types: vec!["*".to_string()],
            delivery_mode: mode,
            group_id: group.map(str::to_string),
            min_interval_seconds: 0,
            expires_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn fanout_subs_all_deliver() {
        let picked = select_deliveries(vec![
            sub(DeliveryMode::Fanout, None),
            sub(DeliveryMode::Fanout, None),
        ]);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn group_subs_deliver_once_per_group() {
        let a = sub(DeliveryMode::Group, Some("pool"));
        let b = sub(DeliveryMode::Group, Some("pool"));
        let winner = a.id.min(b.id);

        let picked = select_deliveries(vec![a, b]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, winner);
    }

    #[test]
    fn wildcard_duplicates_are_dropped() {
        let a = sub(DeliveryMode::Fanout, None);
        let duplicate = a.clone();
        let picked = select_deliveries(vec![a, duplicate]);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn group_without_id_falls_back_to_fanout() {
        let picked = select_deliveries(vec![
            sub(DeliveryMode::Group, None),
            sub(DeliveryMode::Group, None),
        ]);
        assert_eq!(picked.len(), 2);
    }
}
