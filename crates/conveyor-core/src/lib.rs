//! Shared contracts for the conveyor pipeline orchestrator.
//!
//! This crate defines the cross-crate contracts used by the engine and the
//! server: the job model and its typed context bag, the service/feature
//! catalogs, step envelopes, progress events, the step error taxonomy, and
//! the storage traits (`JobStore`, `StateStore`, `JobQueue`) together with
//! their Redis, Postgres, and in-memory implementations.
//!
//! # API notes
//! `conveyor-core` is an internal crate (`publish = false`). Its public API
//! uses a few third-party types (`uuid::Uuid`, `chrono::DateTime<Utc>`,
//! `serde_json::Value`) as part of the conveyor contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{fmt, time::Duration};
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod catalog;
pub mod envelope;
pub mod error;
pub mod events;
pub mod job;
pub mod memory;
pub mod pg;
pub mod redis;

use job::{Job, Priority};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: anyhow::Error,
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: anyhow::anyhow!(message.into()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self { inner: value }
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            inner: anyhow::Error::from(value),
        }
    }
}

impl From<::redis::RedisError> for Error {
    fn from(value: ::redis::RedisError) -> Self {
        Self {
            inner: anyhow::Error::from(value),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            inner: anyhow::Error::from(value),
        }
    }
}

/// Durable job row storage.
///
/// Updates are last-writer-wins full-row writes; at most one worker mutates a
/// given job per step by construction, so no row locking is required.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    async fn update(&self, job: &Job) -> Result<()>;

    /// RUNNING jobs whose `last_progress_at` is older than `cutoff`.
    async fn list_stalled_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    /// PENDING/RUNNING jobs eligible for priority promotion: `low` jobs queued
    /// before `low_cutoff`, and `medium` jobs not originally `high` queued
    /// before `medium_cutoff`.
    async fn list_promotable(
        &self,
        low_cutoff: DateTime<Utc>,
        medium_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>>;
}

/// Shared ephemeral state: concurrency counters, TTL leases, and the pub/sub
/// channels carrying progress events.
///
/// The acquire and release operations MUST each be a single indivisible
/// action at the store; splitting the compare-increment-set-lease sequence
/// loses the limit guarantee under contention. The counter is a cache; the
/// set of surviving lease keys is the truth, and `reap` re-derives the
/// counter from it.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// One attempt to take a lease on `service`. Returns the lease token, or
    /// `None` when the service is at its concurrency limit.
    async fn try_acquire(
        &self,
        service: &str,
        limit: u32,
        lease_ttl: Duration,
    ) -> Result<Option<String>>;

    /// Idempotent: releasing a missing or expired lease is a no-op. The
    /// counter never goes below zero.
    async fn release(&self, service: &str, token: &str) -> Result<()>;

    /// Number of surviving (unexpired) lease keys for `service`.
    async fn lease_count(&self, service: &str) -> Result<u64>;

    /// Current value of the `conc:{service}` counter.
    async fn concurrency(&self, service: &str) -> Result<i64>;

    /// Overwrite the counter with the cardinality of surviving lease keys.
    /// Returns the new counter value.
    async fn reap(&self, service: &str) -> Result<u64>;

    async fn publish(&self, channel: &str, payload: &Value) -> Result<()>;

    /// Subscribe to a channel. The receiver yields every payload published
    /// after the subscription is established.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}

/// A job-id popped from one of the priority queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedJob {
    pub priority: Priority,
    pub job_id: Uuid,
}

/// The three priority-class queues.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, priority: Priority, job_id: Uuid) -> Result<()>;

    /// Non-blocking pop, draining `high_priority` before `medium_priority`
    /// before `low_priority`.
    async fn pop(&self) -> Result<Option<QueuedJob>>;
}
