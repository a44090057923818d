//! Application configuration loaded from environment variables.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;

use crate::common::bloom::BloomConfig;
use crate::kernel::queue::backoff::BackoffPolicy;

/// Direction the claim path walks priority buckets in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityScan {
    /// 9 before 0.
    #[default]
    HighFirst,
    /// 0 before 9.
    LowFirst,
}

impl PriorityScan {
    pub fn buckets(&self) -> Vec<u8> {
        match self {
            Self::HighFirst => (0..=9).rev().collect(),
            Self::LowFirst => (0..=9).collect(),
        }
    }
}

impl FromStr for PriorityScan {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "high_first" => Ok(Self::HighFirst),
            "low_first" => Ok(Self::LowFirst),
            other => bail!("unknown priority scan order: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub kv_url: String,

    // Worker authentication
    pub worker_jwks_url: Option<String>,
    pub worker_issuer: Option<String>,
    pub worker_audience: Option<String>,
    /// HS256 shared secret accepted in development instead of a JWKS.
    pub dev_auth_secret: Option<String>,

    // Webhooks
    pub webhooks_enabled: bool,
    pub webhook_secret: Option<String>,
    pub webhook_timeout: Duration,
    pub notifier_pool_size: usize,
    pub result_webhook_max_attempts: u32,
    pub result_webhook_base_backoff_seconds: i64,
    pub result_webhook_max_backoff_seconds: i64,

    // Queue behavior
    pub default_commands: Vec<String>,
    pub priority_scan: PriorityScan,
    pub default_lease_seconds: u64,
    pub default_max_attempts: u32,
    pub requeue_inspect_limit: usize,
    pub max_wait_seconds: u64,
    pub claim_poll_interval: Duration,
    pub backoff_policy: BackoffPolicy,
    pub backoff_base_seconds: i64,
    pub backoff_max_seconds: i64,
    pub idempotency_ttl_seconds: u64,
    /// Max lifetime of a task hash before the ttl-index sweeper purges it.
    pub task_ttl_seconds: u64,

    // Subscriptions
    pub subscription_default_ttl_seconds: u64,

    // Background loops
    pub promote_interval: Duration,
    pub promote_batch: usize,
    pub subscription_sweep_interval: Duration,
    pub subscription_sweep_batch: usize,
    pub cleanup_interval: Duration,
    pub cleanup_batch: usize,

    // Artifacts
    pub artifact_dir: String,
    pub artifact_base_url: String,

    // Process-local filters
    pub idempotency_bloom: BloomConfig,
    pub ghost_bloom: BloomConfig,
    pub cleanup_bloom: BloomConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            kv_url: "redis://127.0.0.1:6379".to_string(),
            worker_jwks_url: None,
            worker_issuer: None,
            worker_audience: None,
            dev_auth_secret: None,
            webhooks_enabled: true,
            webhook_secret: None,
            webhook_timeout: Duration::from_secs(10),
            notifier_pool_size: 8,
            result_webhook_max_attempts: 5,
            result_webhook_base_backoff_seconds: 1,
            result_webhook_max_backoff_seconds: 60,
            default_commands: Vec::new(),
            priority_scan: PriorityScan::HighFirst,
            default_lease_seconds: 60,
            default_max_attempts: 3,
            requeue_inspect_limit: 32,
            max_wait_seconds: 30,
            claim_poll_interval: Duration::from_millis(100),
            backoff_policy: BackoffPolicy::ExpFullJitter,
            backoff_base_seconds: 2,
            backoff_max_seconds: 300,
            idempotency_ttl_seconds: 1800,
            task_ttl_seconds: 7 * 24 * 3600,
            subscription_default_ttl_seconds: 300,
            promote_interval: Duration::from_secs(1),
            promote_batch: 128,
            subscription_sweep_interval: Duration::from_secs(60),
            subscription_sweep_batch: 256,
            cleanup_interval: Duration::from_secs(300),
            cleanup_batch: 256,
            artifact_dir: "./data/artifacts".to_string(),
            artifact_base_url: "/artifacts".to_string(),
            idempotency_bloom: BloomConfig {
                capacity: 1_000_000,
                false_positive_rate: 0.01,
                rotate_every: Duration::from_secs(1800),
            },
            ghost_bloom: BloomConfig {
                capacity: 2_000_000,
                false_positive_rate: 1e-12,
                rotate_every: Duration::from_secs(6 * 3600),
            },
            cleanup_bloom: BloomConfig {
                capacity: 2_000_000,
                false_positive_rate: 0.01,
                rotate_every: Duration::from_secs(6 * 3600),
            },
        }
    }
}

impl Config {
    /// Load configuration from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();

        Ok(Self {
            port: parsed("CODEQ_PORT", defaults.port)?,
            kv_url: env::var("CODEQ_KV_URL").unwrap_or(defaults.kv_url),
            worker_jwks_url: env::var("CODEQ_WORKER_JWKS_URL").ok(),
            worker_issuer: env::var("CODEQ_WORKER_ISSUER").ok(),
            worker_audience: env::var("CODEQ_WORKER_AUDIENCE").ok(),
            dev_auth_secret: env::var("CODEQ_DEV_AUTH_SECRET").ok(),
            webhooks_enabled: parsed("CODEQ_WEBHOOKS_ENABLED", defaults.webhooks_enabled)?,
            webhook_secret: env::var("CODEQ_WEBHOOK_SECRET").ok(),
            webhook_timeout: seconds("CODEQ_WEBHOOK_TIMEOUT_SECONDS", defaults.webhook_timeout)?,
            notifier_pool_size: parsed("CODEQ_NOTIFIER_POOL_SIZE", defaults.notifier_pool_size)?,
            result_webhook_max_attempts: parsed(
                "CODEQ_RESULT_WEBHOOK_MAX_ATTEMPTS",
                defaults.result_webhook_max_attempts,
            )?,
            result_webhook_base_backoff_seconds: parsed(
                "CODEQ_RESULT_WEBHOOK_BASE_BACKOFF_SECONDS",
                defaults.result_webhook_base_backoff_seconds,
            )?,
            result_webhook_max_backoff_seconds: parsed(
                "CODEQ_RESULT_WEBHOOK_MAX_BACKOFF_SECONDS",
                defaults.result_webhook_max_backoff_seconds,
            )?,
            default_commands: list("CODEQ_DEFAULT_COMMANDS"),
            priority_scan: parsed("CODEQ_PRIORITY_SCAN", defaults.priority_scan)?,
            default_lease_seconds: parsed(
                "CODEQ_DEFAULT_LEASE_SECONDS",
                defaults.default_lease_seconds,
            )?,
            default_max_attempts: parsed(
                "CODEQ_DEFAULT_MAX_ATTEMPTS",
                defaults.default_max_attempts,
            )?,
            requeue_inspect_limit: parsed(
                "CODEQ_REQUEUE_INSPECT_LIMIT",
                defaults.requeue_inspect_limit,
            )?,
            max_wait_seconds: parsed("CODEQ_MAX_WAIT_SECONDS", defaults.max_wait_seconds)?,
            claim_poll_interval: millis(
                "CODEQ_CLAIM_POLL_INTERVAL_MS",
                defaults.claim_poll_interval,
            )?,
            backoff_policy: parsed("CODEQ_BACKOFF_POLICY", defaults.backoff_policy)?,
            backoff_base_seconds: parsed(
                "CODEQ_BACKOFF_BASE_SECONDS",
                defaults.backoff_base_seconds,
            )?,
            backoff_max_seconds: parsed("CODEQ_BACKOFF_MAX_SECONDS", defaults.backoff_max_seconds)?,
            idempotency_ttl_seconds: parsed(
                "CODEQ_IDEMPOTENCY_TTL_SECONDS",
                defaults.idempotency_ttl_seconds,
            )?,
            task_ttl_seconds: parsed("CODEQ_TASK_TTL_SECONDS", defaults.task_ttl_seconds)?,
            subscription_default_ttl_seconds: parsed(
                "CODEQ_SUBSCRIPTION_DEFAULT_TTL_SECONDS",
                defaults.subscription_default_ttl_seconds,
            )?,
            promote_interval: seconds(
                "CODEQ_PROMOTE_INTERVAL_SECONDS",
                defaults.promote_interval,
            )?,
            promote_batch: parsed("CODEQ_PROMOTE_BATCH", defaults.promote_batch)?,
            subscription_sweep_interval: seconds(
                "CODEQ_SUBSCRIPTION_SWEEP_INTERVAL_SECONDS",
                defaults.subscription_sweep_interval,
            )?,
            subscription_sweep_batch: parsed(
                "CODEQ_SUBSCRIPTION_SWEEP_BATCH",
                defaults.subscription_sweep_batch,
            )?,
            cleanup_interval: seconds("CODEQ_CLEANUP_INTERVAL_SECONDS", defaults.cleanup_interval)?,
            cleanup_batch: parsed("CODEQ_CLEANUP_BATCH", defaults.cleanup_batch)?,
            artifact_dir: env::var("CODEQ_ARTIFACT_DIR").unwrap_or(defaults.artifact_dir),
            artifact_base_url: env::var("CODEQ_ARTIFACT_BASE_URL")
                .unwrap_or(defaults.artifact_base_url),
            idempotency_bloom: bloom(
                "CODEQ_IDEMPOTENCY_BLOOM",
                defaults.idempotency_bloom,
            )?,
            ghost_bloom: bloom("CODEQ_GHOST_BLOOM", defaults.ghost_bloom)?,
            cleanup_bloom: bloom("CODEQ_CLEANUP_BLOOM", defaults.cleanup_bloom)?,
        })
    }

    /// Checks required for non-development deployments.
    pub fn validate(&self) -> Result<()> {
        if self.worker_jwks_url.is_none() && self.dev_auth_secret.is_none() {
            bail!("either CODEQ_WORKER_JWKS_URL or CODEQ_DEV_AUTH_SECRET must be set");
        }
        if self.worker_jwks_url.is_some() {
            if self.worker_issuer.is_none() {
                bail!("CODEQ_WORKER_ISSUER must be set when a JWKS URL is configured");
            }
            if self.worker_audience.is_none() {
                bail!("CODEQ_WORKER_AUDIENCE must be set when a JWKS URL is configured");
            }
        }
        if self.webhooks_enabled && self.webhook_secret.is_none() {
            bail!("CODEQ_WEBHOOK_SECRET must be set while webhooks are enabled");
        }
        Ok(())
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

fn seconds(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(parsed(key, default.as_secs())?))
}

fn millis(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_millis(parsed(
        key,
        default.as_millis() as u64,
    )?))
}

fn list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Bloom knobs come in as `<PREFIX>_CAPACITY`, `<PREFIX>_FPR`,
/// `<PREFIX>_ROTATE_SECONDS`.
fn bloom(prefix: &str, default: BloomConfig) -> Result<BloomConfig> {
    Ok(BloomConfig {
        capacity: parsed(&format!("{prefix}_CAPACITY"), default.capacity)
            .context("bloom capacity")?,
        false_positive_rate: parsed(&format!("{prefix}_FPR"), default.false_positive_rate)
            .context("bloom false positive rate")?,
        rotate_every: seconds(&format!("{prefix}_ROTATE_SECONDS"), default.rotate_every)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.default_lease_seconds, 60);
        assert_eq!(config.priority_scan, PriorityScan::HighFirst);
        assert_eq!(config.backoff_policy, BackoffPolicy::ExpFullJitter);
        assert!(config.webhooks_enabled);
    }

    #[test]
    fn high_first_scans_nine_down_to_zero() {
        assert_eq!(PriorityScan::HighFirst.buckets().first(), Some(&9));
        assert_eq!(PriorityScan::HighFirst.buckets().last(), Some(&0));
        assert_eq!(PriorityScan::LowFirst.buckets().first(), Some(&0));
    }

    #[test]
    fn validate_requires_some_auth_source() {
        let config = Config {
            webhooks_enabled: false,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            dev_auth_secret: Some("secret".into()),
            webhooks_enabled: false,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_requires_webhook_secret_when_enabled() {
        let config = Config {
            dev_auth_secret: Some("secret".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            dev_auth_secret: Some("secret".into()),
            webhook_secret: Some("hmac".into()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }
}
