//! Subscription registry.
//!
//! A subscription is a hash under `sub:{id}`, indexed by each of its event
//! types in `subs:{event}` with `expiresAt` as the score. Stale entries
//! disappear via bounded range sweeps; heartbeats push the score forward.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{QueueError, QueueResult, SubscriptionId};
use crate::kernel::kv::Kv;
use crate::kernel::queue::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Every matching subscription receives the event.
    #[default]
    Fanout,
    /// One subscription per `groupId` receives the event.
    Group,
}

impl DeliveryMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Fanout => "fanout",
            Self::Group => "group",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "fanout" => Some(Self::Fanout),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: SubscriptionId,
    pub callback_url: String,
    pub event_types: Vec<String>,
    pub delivery_mode: DeliveryMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub min_interval_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub struct NewSubscription {
    pub callback_url: String,
    pub event_types: Vec<String>,
    pub delivery_mode: DeliveryMode,
    pub group_id: Option<String>,
    pub min_interval_seconds: u64,
    pub ttl_seconds: u64,
}

pub struct SubscriptionRepo {
    kv: Kv,
}

impl SubscriptionRepo {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    pub async fn create(&self, new: NewSubscription) -> QueueResult<Subscription> {
        let now = Utc::now();
        let sub = Subscription {
            id: SubscriptionId::new(),
            callback_url: new.callback_url,
            event_types: new.event_types,
            delivery_mode: new.delivery_mode,
            group_id: new.group_id,
            min_interval_seconds: new.min_interval_seconds,
            expires_at: now + chrono::Duration::seconds(new.ttl_seconds as i64),
            created_at: now,
        };

        let mut pipe = redis::pipe();
        pipe.cmd("HSET").arg(keys::subscription(&sub.id));
        for (field, value) in hash_fields(&sub) {
            pipe.arg(field).arg(value);
        }
        for event in &sub.event_types {
            pipe.cmd("ZADD")
                .arg(keys::subscriptions(event))
                .arg(sub.expires_at.timestamp())
                .arg(sub.id.to_string());
        }
        let mut conn = self.kv.conn();
        let _: Vec<redis::Value> = pipe.query_async(&mut conn).await?;

        debug!(subscription_id = %sub.id, events = ?sub.event_types, "subscription created");
        Ok(sub)
    }

    pub async fn get(&self, id: &SubscriptionId) -> QueueResult<Subscription> {
        let mut conn = self.kv.conn();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(keys::subscription(id))
            .query_async(&mut conn)
            .await?;
        if map.is_empty() {
            return Err(QueueError::NotFound("subscription"));
        }
        from_hash(&map)
    }

    /// Push the expiry forward by `ttl_seconds` from now.
    pub async fn heartbeat(
        &self,
        id: &SubscriptionId,
        ttl_seconds: u64,
    ) -> QueueResult<Subscription> {
        let mut sub = self.get(id).await?;
        sub.expires_at = Utc::now() + chrono::Duration::seconds(ttl_seconds as i64);

        let mut pipe = redis::pipe();
        pipe.cmd("HSET")
            .arg(keys::subscription(id))
            .arg("expires_at")
            .arg(sub.expires_at.timestamp());
        for event in &sub.event_types {
            pipe.cmd("ZADD")
                .arg(keys::subscriptions(event))
                .arg("XX")
                .arg(sub.expires_at.timestamp())
                .arg(id.to_string());
        }
        let mut conn = self.kv.conn();
        let _: Vec<redis::Value> = pipe.query_async(&mut conn).await?;
        Ok(sub)
    }

    /// Subscriptions for one event type whose expiry is at or past `now`.
    pub async fn list_active(
        &self,
        event: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Vec<Subscription>> {
        let mut conn = self.kv.conn();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(keys::subscriptions(event))
            .arg(now.timestamp())
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("HGETALL").arg(format!("sub:{id}"));
        }
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        Ok(hashes
            .iter()
            .filter(|map| !map.is_empty())
            .filter_map(|map| from_hash(map).ok())
            .collect())
    }

    /// Remove entries whose score fell behind `now`, at most `batch` per
    /// event set. Returns the number of index entries removed.
    pub async fn sweep(&self, now: DateTime<Utc>, batch: usize) -> QueueResult<u64> {
        let mut conn = self.kv.conn();

        let mut cursor: u64 = 0;
        let mut sets = Vec::new();
        loop {
            let (next, keys_batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("subs:*")
                .arg("COUNT")
                .arg(256)
                .query_async(&mut conn)
                .await?;
            sets.extend(keys_batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let mut removed = 0;
        for set in sets {
            let stale: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&set)
                .arg("-inf")
                .arg(format!("({}", now.timestamp()))
                .arg("LIMIT")
                .arg(0)
                .arg(batch)
                .query_async(&mut conn)
                .await?;
            for id in stale {
                let _: i64 = redis::cmd("ZREM")
                    .arg(&set)
                    .arg(&id)
                    .query_async(&mut conn)
                    .await?;
                removed += 1;

                // The hash goes too, unless a heartbeat revived it since
                // this index entry went stale.
                let expires_at: Option<i64> = redis::cmd("HGET")
                    .arg(format!("sub:{id}"))
                    .arg("expires_at")
                    .query_async(&mut conn)
                    .await?;
                if expires_at.map(|at| at < now.timestamp()).unwrap_or(false) {
                    let _: i64 = redis::cmd("DEL")
                        .arg(format!("sub:{id}"))
                        .query_async(&mut conn)
                        .await?;
                }
            }
        }
        Ok(removed)
    }
}

fn hash_fields(sub: &Subscription) -> Vec<(&'static str, String)> {
    vec![
        ("id", sub.id.to_string()),
        ("callback_url", sub.callback_url.clone()),
        (
            "event_types",
            serde_json::to_string(&sub.event_types).unwrap_or_else(|_| "[]".to_string()),
        ),
        ("delivery_mode", sub.delivery_mode.as_str().to_string()),
        ("group_id", sub.group_id.clone().unwrap_or_default()),
        (
            "min_interval_seconds",
            sub.min_interval_seconds.to_string(),
        ),
        ("expires_at", sub.expires_at.timestamp().to_string()),
        ("created_at", sub.created_at.timestamp().to_string()),
    ]
}

fn field<'m>(map: &'m HashMap<String, String>, name: &str) -> QueueResult<&'m str> {
    map.get(name).map(String::as_str).ok_or_else(|| {
        QueueError::Internal(anyhow::anyhow!("subscription hash missing field {name}"))
    })
}

fn from_hash(map: &HashMap<String, String>) -> QueueResult<Subscription> {
    let field = |name| field(map, name);

    let id: SubscriptionId = field("id")?
        .parse()
        .map_err(|e| QueueError::Internal(anyhow::anyhow!("subscription id invalid: {e}")))?;
    let event_types: Vec<String> = serde_json::from_str(field("event_types")?)
        .map_err(|e| QueueError::Internal(anyhow::anyhow!("subscription events invalid: {e}")))?;

    Ok(Subscription {
        id,
        callback_url: field("callback_url")?.to_string(),
        event_types,
        delivery_mode: DeliveryMode::parse(field("delivery_mode")?).unwrap_or_default(),
        group_id: map.get("group_id").filter(|v| !v.is_empty()).cloned(),
        min_interval_seconds: field("min_interval_seconds")?.parse().unwrap_or(0),
        expires_at: parse_unix(field("expires_at")?)
            .ok_or_else(|| QueueError::Internal(anyhow::anyhow!("subscription expiry invalid")))?,
        created_at: parse_unix(field("created_at")?).unwrap_or_else(Utc::now),
    })
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

    fn sample() -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            callback_url: "https://worker.example.com/hook".to_string(),
            event_types: vec!["GENERATE_MASTER".to_string(), "*".to_string()],
            delivery_mode: DeliveryMode::Group,
            group_id: Some("render-pool".to_string()),
            min_interval_seconds: 10,
            expires_at: Utc.timestamp_opt(1_700_000_600, 0).unwrap(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn hash_roundtrip() {
        let sub = sample();
        let map: HashMap<String, String> = hash_fields(&sub)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let rebuilt = from_hash(&map).unwrap();
        assert_eq!(rebuilt.id, sub.id);
        assert_eq!(rebuilt.event_types, sub.event_types);
        assert_eq!(rebuilt.delivery_mode, DeliveryMode::Group);
        assert_eq!(rebuilt.group_id, sub.group_id);
        assert_eq!(rebuilt.expires_at, sub.expires_at);
    }

    #[test]
    fn delivery_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeliveryMode::Fanout).unwrap(),
            "\"fanout\""
        );
        assert_eq!(DeliveryMode::parse("group"), Some(DeliveryMode::Group));
        assert_eq!(DeliveryMode::parse("weird"), None);
    }
}
