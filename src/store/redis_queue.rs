use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;

use super::{queue_key, ConnectionState, FastStore, MalformedEntry};
use crate::models::token::TokenSummary;

/// Redis-backed fast queue.
///
/// Each counter's queue is a list at `counter:<id>` holding JSON summaries;
/// RPUSH appends, LPOP dequeues. The connection manager is created on first
/// use so the process can start while Redis is down.
pub struct RedisQueue {
    client: redis::Client,
    manager: RwLock<Option<ConnectionManager>>,
    connection: ConnectionState,
    op_timeout: Duration,
}

impl RedisQueue {
    pub fn new(redis_url: &str, connection: ConnectionState, op_timeout: Duration) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;
        Ok(Self {
            client,
            manager: RwLock::new(None),
            connection,
            op_timeout,
        })
    }

    async fn conn(&self) -> anyhow::Result<ConnectionManager> {
        if let Some(conn) = self.manager.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut slot = self.manager.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .bounded("connect", ConnectionManager::new(self.client.clone()))
            .await?;
        tracing::info!("Redis connection manager established");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Run one Redis call under the store timeout. Failures flip the shared
    /// connection flag so callers fail fast until the watchdog sees recovery.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        let result = match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context(format!("redis {} failed", op))),
            Err(_) => Err(anyhow::anyhow!("redis {} timed out after {:?}", op, self.op_timeout)),
        };
        if let Err(ref e) = result {
            if self.connection.mark_disconnected() {
                tracing::warn!(op, error = %e, "fast store marked disconnected");
            }
        }
        result
    }
}

fn decode(counter_id: i32, raw: &str) -> Result<TokenSummary, MalformedEntry> {
    serde_json::from_str(raw).map_err(|_| MalformedEntry {
        counter_id,
        raw: raw.to_string(),
    })
}

#[async_trait]
impl FastStore for RedisQueue {
    async fn push(&self, counter_id: i32, entry: &TokenSummary) -> anyhow::Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut conn = self.conn().await?;
        self.bounded("rpush", conn.rpush::<_, _, ()>(queue_key(counter_id), json))
            .await
    }

    async fn push_front(&self, counter_id: i32, entry: &TokenSummary) -> anyhow::Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut conn = self.conn().await?;
        self.bounded("lpush", conn.lpush::<_, _, ()>(queue_key(counter_id), json))
            .await
    }

    async fn pop(&self, counter_id: i32) -> anyhow::Result<Option<TokenSummary>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = self
            .bounded("lpop", conn.lpop(queue_key(counter_id), None))
            .await?;
        Ok(raw.map(|r| decode(counter_id, &r)).transpose()?)
    }

    async fn remove(&self, counter_id: i32, token_id: &str) -> anyhow::Result<usize> {
        let mut conn = self.conn().await?;
        // Drain, filter, restore in one script so concurrent pushes and pops
        // never observe the half-rewritten list.
        let script = redis::Script::new(
            r#"
            local items = redis.call("LRANGE", KEYS[1], 0, -1)
            redis.call("DEL", KEYS[1])
            local removed = 0
            for _, raw in ipairs(items) do
                local ok, entry = pcall(cjson.decode, raw)
                if ok and type(entry) == "table" and entry["token_id"] == ARGV[1] then
                    removed = removed + 1
                else
                    redis.call("RPUSH", KEYS[1], raw)
                end
            end
            return removed
        "#,
        );
        let removed: u64 = self
            .bounded(
                "remove",
                script.key(queue_key(counter_id)).arg(token_id).invoke_async(&mut conn),
            )
            .await?;
        Ok(removed as usize)
    }

    async fn entries(&self, counter_id: i32) -> anyhow::Result<Vec<TokenSummary>> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = self
            .bounded("lrange", conn.lrange(queue_key(counter_id), 0, -1))
            .await?;
        Ok(raw
            .iter()
            .map(|r| decode(counter_id, r))
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn replace(&self, counter_id: i32, entries: &[TokenSummary]) -> anyhow::Result<()> {
        let key = queue_key(counter_id);
        let values = entries
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        if !values.is_empty() {
            pipe.rpush(&key, values).ignore();
        }

        let mut conn = self.conn().await?;
        self.bounded("replace", pipe.query_async::<_, ()>(&mut conn))
            .await
    }

    async fn increment(&self, key: &str, ttl_secs: u64) -> anyhow::Result<u64> {
        let mut conn = self.conn().await?;
        // Atomic INCR + EXPIRE
        let script = redis::Script::new(
            r#"
            local current = redis.call("INCR", KEYS[1])
            if current == 1 then
                redis.call("EXPIRE", KEYS[1], ARGV[1])
            end
            return current
        "#,
        );
        self.bounded("incr", script.key(key).arg(ttl_secs).invoke_async(&mut conn))
            .await
    }

    async fn raise_to(&self, key: &str, floor: u64, ttl_secs: u64) -> anyhow::Result<u64> {
        let mut conn = self.conn().await?;
        // Set-if-greater; SET drops the TTL, so restore the midnight expiry
        let script = redis::Script::new(
            r#"
            local current = tonumber(redis.call("GET", KEYS[1]) or "0")
            local floor = tonumber(ARGV[1])
            if current < floor then
                redis.call("SET", KEYS[1], ARGV[1])
                current = floor
            end
            if redis.call("TTL", KEYS[1]) == -1 then
                redis.call("EXPIRE", KEYS[1], ARGV[2])
            end
            return current
        "#,
        );
        self.bounded(
            "raise",
            script.key(key).arg(floor).arg(ttl_secs).invoke_async(&mut conn),
        )
        .await
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let _pong: String = self
            .bounded("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}
