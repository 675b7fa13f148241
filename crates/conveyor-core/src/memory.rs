//! In-memory implementations of the storage traits.
//!
//! These back the engine and API tests and single-process development runs.
//! They honor the same contracts as the Redis/Postgres implementations; in
//! particular [`MemoryStateStore`] keeps the counter and the lease set as
//! separate state so counter drift and reaping behave as they do on Redis.

use crate::job::{Job, JobStatus, Priority};
use crate::{JobQueue, JobStore, QueuedJob, Result, StateStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Default)]
struct StateInner {
    counters: HashMap<String, i64>,
    /// service -> token -> lease expiry.
    leases: HashMap<String, HashMap<String, Instant>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<StateInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a lease key without releasing it, leaving the counter untouched.
    /// Simulates an orchestrator crash (or TTL expiry) in tests.
    pub fn expire_lease(&self, service: &str, token: &str) {
        let mut inner = self.inner.lock().expect("state lock");
        if let Some(leases) = inner.leases.get_mut(service) {
            leases.remove(token);
        }
    }

    fn purge_expired(inner: &mut StateInner, service: &str, now: Instant) {
        if let Some(leases) = inner.leases.get_mut(service) {
            leases.retain(|_, expires_at| *expires_at > now);
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn try_acquire(
        &self,
        service: &str,
        limit: u32,
        lease_ttl: Duration,
    ) -> Result<Option<String>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("state lock");
        Self::purge_expired(&mut inner, service, now);

        let current = inner.counters.get(service).copied().unwrap_or(0);
        if current >= i64::from(limit) {
            return Ok(None);
        }

        let token = Uuid::new_v4().to_string();
        *inner.counters.entry(service.to_string()).or_insert(0) += 1;
        inner
            .leases
            .entry(service.to_string())
            .or_default()
            .insert(token.clone(), now + lease_ttl);
        Ok(Some(token))
    }

    async fn release(&self, service: &str, token: &str) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("state lock");
        Self::purge_expired(&mut inner, service, now);

        let existed = inner
            .leases
            .get_mut(service)
            .map(|leases| leases.remove(token).is_some())
            .unwrap_or(false);
        if existed {
            let counter = inner.counters.entry(service.to_string()).or_insert(0);
            if *counter > 0 {
                *counter -= 1;
            }
        }
        Ok(())
    }

    async fn lease_count(&self, service: &str) -> Result<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("state lock");
        Self::purge_expired(&mut inner, service, now);
        Ok(inner
            .leases
            .get(service)
            .map(|leases| leases.len() as u64)
            .unwrap_or(0))
    }

    async fn concurrency(&self, service: &str) -> Result<i64> {
        let inner = self.inner.lock().expect("state lock");
        Ok(inner.counters.get(service).copied().unwrap_or(0))
    }

    async fn reap(&self, service: &str) -> Result<u64> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("state lock");
        Self::purge_expired(&mut inner, service, now);
        let live = inner
            .leases
            .get(service)
            .map(|leases| leases.len() as u64)
            .unwrap_or(0);
        inner.counters.insert(service.to_string(), live as i64);
        Ok(live)
    }

    async fn publish(&self, channel: &str, payload: &Value) -> Result<()> {
        let raw = payload.to_string();
        let mut inner = self.inner.lock().expect("state lock");
        if let Some(subscribers) = inner.subscribers.get_mut(channel) {
            // Drop closed receivers; a full receiver just misses this event.
            subscribers.retain(|tx| match tx.try_send(raw.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.inner.lock().expect("state lock");
        inner
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[derive(Default)]
pub struct MemoryJobQueue {
    queues: Mutex<BTreeMap<&'static str, VecDeque<Uuid>>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self, priority: Priority) -> usize {
        let queues = self.queues.lock().expect("queue lock");
        queues.get(priority.queue()).map(VecDeque::len).unwrap_or(0)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, priority: Priority, job_id: Uuid) -> Result<()> {
        let mut queues = self.queues.lock().expect("queue lock");
        queues.entry(priority.queue()).or_default().push_back(job_id);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<QueuedJob>> {
        let mut queues = self.queues.lock().expect("queue lock");
        for priority in Priority::ALL {
            if let Some(job_id) = queues
                .get_mut(priority.queue())
                .and_then(VecDeque::pop_front)
            {
                return Ok(Some(QueuedJob { priority, job_id }));
            }
        }
        Ok(None)
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("job lock");
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let jobs = self.jobs.lock().expect("job lock");
        Ok(jobs.get(&id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("job lock");
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_stalled_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().expect("job lock");
        Ok(jobs
            .values()
            .filter(|job| job.status == JobStatus::Running && job.last_progress_at < cutoff)
            .cloned()
            .collect())
    }

    async fn list_promotable(
        &self,
        low_cutoff: DateTime<Utc>,
        medium_cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().expect("job lock");
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|job| matches!(job.status, JobStatus::Pending | JobStatus::Running))
            .filter(|job| match job.priority {
                Priority::Low => job.queued_at < low_cutoff,
                Priority::Medium => {
                    job.original_priority != Priority::High && job.queued_at < medium_cutoff
                }
                Priority::High => false,
            })
            .cloned()
            .collect();
        out.sort_by_key(|job| job.queued_at);
        Ok(out)
    }
}
