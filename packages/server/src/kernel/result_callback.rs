//! Targeted result callback.
//!
//! On terminal transition the result event is delivered once to the task's
//! own webhook URL, with bounded exponential retries. Non-2xx responses,
//! timeouts, and connection errors are all retryable; exhaustion is logged
//! and metered, never dead-lettered.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::thread_rng;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};

use crate::config::Config;
use crate::kernel::events::ResultEvent;
use crate::kernel::metrics::QueueMetrics;
use crate::kernel::queue::backoff::{self, BackoffPolicy};
use crate::kernel::webhook;

pub struct ResultCallback {
    http: reqwest::Client,
    secret: Option<Vec<u8>>,
    max_attempts: u32,
    base_backoff_seconds: i64,
    max_backoff_seconds: i64,
    timeout: Duration,
    enabled: bool,
    metrics: Arc<QueueMetrics>,
}

impl ResultCallback {
    pub fn new(config: &Config, metrics: Arc<QueueMetrics>) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret: config.webhook_secret.as_ref().map(|s| s.as_bytes().to_vec()),
            max_attempts: config.result_webhook_max_attempts.max(1),
            base_backoff_seconds: config.result_webhook_base_backoff_seconds,
            max_backoff_seconds: config.result_webhook_max_backoff_seconds,
            timeout: config.webhook_timeout,
            enabled: config.webhooks_enabled,
            metrics,
        }
    }

    /// Deliver in the background; the submitting request never waits on or
    /// fails with the webhook.
    pub fn deliver(self: &Arc<Self>, url: String, event: ResultEvent) {
        if !self.enabled {
            return;
        }
        let callback = Arc::clone(self);
        tokio::spawn(async move {
            callback.deliver_with_retry(url, event).await;
        });
    }

    async fn deliver_with_retry(&self, url: String, event: ResultEvent) {
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, task_id = %event.task_id, "result event encoding failed");
                return;
            }
        };
        let signature = self.secret.as_deref().map(|s| webhook::sign(s, &body));

        for attempt in 0..self.max_attempts {
            let started = std::time::Instant::now();
            let outcome = self.post_once(&url, &body, signature.as_deref()).await;
            self.metrics
                .webhook_latency_seconds
                .with_label_values(&["result"])
                .observe(started.elapsed().as_secs_f64());

            match outcome {
                Ok(()) => {
                    debug!(task_id = %event.task_id, attempt, "result webhook delivered");
                    self.metrics
                        .webhook_deliveries
                        .with_label_values(&["result", "ok"])
                        .inc();
                    return;
                }
                Err(error) => {
                    debug!(task_id = %event.task_id, attempt, %error, "result webhook attempt failed");
                    if attempt + 1 < self.max_attempts {
                        let delay = backoff::delay_seconds(
                            BackoffPolicy::Exponential,
                            self.base_backoff_seconds,
                            self.max_backoff_seconds,
                            attempt,
                            &mut thread_rng(),
                        );
                        tokio::time::sleep(Duration::from_secs(delay as u64)).await;
                    }
                }
            }
        }

        warn!(task_id = %event.task_id, url = %url, attempts = self.max_attempts,
            "result webhook exhausted retries");
        self.metrics
            .webhook_deliveries
            .with_label_values(&["result", "exhausted"])
            .inc();
    }

    async fn post_once(&self, url: &str, body: &[u8], signature: Option<&str>) -> Result<()> {
        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(body.to_vec());
        if let Some(signature) = signature {
            request = request.header(webhook::SIGNATURE_HEADER, signature);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("webhook returned {}", response.status()));
        }
        Ok(())
    }
}
