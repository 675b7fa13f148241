//! Redis-backed shared state and priority queues.
//!
//! The acquire and release paths are single Lua scripts so the
//! compare-increment-set-lease and delete-decrement sequences are indivisible
//! at the store. The `conc:{service}` counter is only a cache of live
//! concurrency; the `lease:{service}:{token}` keys (with TTL) are the truth,
//! and [`StateStore::reap`] overwrites the counter with their cardinality.

use crate::job::Priority;
use crate::{JobQueue, QueuedJob, Result, StateStore};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

// Refuses when the counter is at the limit; otherwise increments and writes
// the lease key with its TTL in the same script invocation.
const ACQUIRE_SCRIPT: &str = r#"
local counter_key = KEYS[1]
local lease_key = KEYS[2]
local limit = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local cur = tonumber(redis.call("GET", counter_key) or "0")
if cur >= limit then
    return nil
end

redis.call("INCR", counter_key)
redis.call("SET", lease_key, "1", "EX", ttl)
return 1
"#;

// Decrements only when the lease key still existed, and clamps at zero, so a
// double release or a release after TTL expiry is a no-op.
const RELEASE_SCRIPT: &str = r#"
local counter_key = KEYS[1]
local lease_key = KEYS[2]
if redis.call("DEL", lease_key) == 1 then
    local cur = tonumber(redis.call("GET", counter_key) or "0")
    if cur > 0 then redis.call("DECR", counter_key) end
end
return 1
"#;

fn counter_key(service: &str) -> String {
    format!("conc:{service}")
}

fn lease_key(service: &str, token: &str) -> String {
    format!("lease:{service}:{token}")
}

fn lease_pattern(service: &str) -> String {
    format!("lease:{service}:*")
}

#[derive(Clone)]
pub struct RedisStateStore {
    client: Client,
    conn: ConnectionManager,
    acquire: Script,
    release: Script,
}

impl RedisStateStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    /// Shared multiplexed connection, for building a [`RedisJobQueue`] on the
    /// same server.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn try_acquire(
        &self,
        service: &str,
        limit: u32,
        lease_ttl: Duration,
    ) -> Result<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let ttl_secs = lease_ttl.as_secs().max(1);
        let mut conn = self.conn.clone();
        let granted: Option<i64> = self
            .acquire
            .key(counter_key(service))
            .key(lease_key(service, &token))
            .arg(limit)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted.map(|_| token))
    }

    async fn release(&self, service: &str, token: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release
            .key(counter_key(service))
            .key(lease_key(service, token))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn lease_count(&self, service: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(lease_pattern(service)).await?;
        Ok(keys.len() as u64)
    }

    async fn concurrency(&self, service: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(counter_key(service)).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn reap(&self, service: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(lease_pattern(service)).await?;
        let live = keys.len() as u64;
        let _: () = conn.set(counter_key(service), live).await?;
        Ok(live)
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload.to_string()).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    // Receiver dropped; unsubscribes when the stream drops.
                    break;
                }
            }
        });

        Ok(rx)
    }
}

/// Priority queues as Redis lists, one per class, keyed by the queue name.
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
}

impl RedisJobQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, priority: Priority, job_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(priority.queue(), job_id.to_string()).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<QueuedJob>> {
        let mut conn = self.conn.clone();
        for priority in Priority::ALL {
            let popped: Option<String> = conn.lpop(priority.queue(), None).await?;
            let Some(raw) = popped else {
                continue;
            };
            let job_id = Uuid::parse_str(&raw)
                .map_err(|err| crate::Error::msg(format!("bad job id on {}: {err}", priority.queue())))?;
            return Ok(Some(QueuedJob { priority, job_id }));
        }
        Ok(None)
    }
}
