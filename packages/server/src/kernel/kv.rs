//! KV accessor for the Redis-protocol store.
//!
//! All queue state lives in KVRocks behind this thin wrapper. Multi-key
//! transitions run as server-side scripts ([`Kv::script`]); read aggregation
//! goes through pipelines built by callers on a cloned connection. The
//! `redis` crate loads each script once and re-invokes it by SHA.

use anyhow::Context;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue, Script, Value};

use crate::common::{QueueError, QueueResult};

#[derive(Clone)]
pub struct Kv {
    conn: ConnectionManager,
}

impl Kv {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url).context("invalid KV url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to KV store")?;
        Ok(Self { conn })
    }

    /// A cloned connection handle for pipelines and plain commands.
    pub fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn();
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(QueueError::from)?;
        Ok(())
    }

    /// Invoke an atomic script with string keys and args.
    pub async fn script<T: FromRedisValue>(
        &self,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> QueueResult<T> {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }
        let mut conn = self.conn();
        Ok(invocation.invoke_async(&mut conn).await?)
    }
}

/// Decode the integer discriminator at `index` of a script reply.
pub fn reply_int(reply: &[Value], index: usize) -> QueueResult<i64> {
    let value = reply
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("script reply too short: want index {index}"))?;
    redis::from_redis_value(value).map_err(QueueError::from)
}

/// Decode an optional string at `index` of a script reply.
pub fn reply_string(reply: &[Value], index: usize) -> QueueResult<Option<String>> {
    match reply.get(index) {
        None | Some(Value::Nil) => Ok(None),
        Some(value) => redis::from_redis_value(value)
            .map(Some)
            .map_err(QueueError::from),
    }
}
