//! Periodic repair tasks: lease reaper, stuck-job detector, priority
//! promoter.
//!
//! Each task is a `*_once` function taking `now` so behaviour is testable
//! without clock control, plus a shutdown-aware loop wrapper.

use crate::events::EventPublisher;
use chrono::{DateTime, Utc};
use conveyor_core::catalog::ServiceCatalog;
use conveyor_core::error::codes;
use conveyor_core::events::{ErrorAction, JobEvent};
use conveyor_core::job::{JobStatus, Priority};
use conveyor_core::{JobQueue, JobStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub reap_interval: Duration,
    pub stuck_interval: Duration,
    /// A RUNNING job with no progress for this long is failed as stuck.
    pub stuck_after: Duration,
    pub promote_interval: Duration,
    pub promote_low_after: Duration,
    pub promote_medium_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(30),
            stuck_interval: Duration::from_secs(60),
            stuck_after: Duration::from_secs(7200),
            promote_interval: Duration::from_secs(300),
            promote_low_after: Duration::from_secs(1800),
            promote_medium_after: Duration::from_secs(3600),
        }
    }
}

/// Overwrite every service counter with the cardinality of its surviving
/// lease keys. The counter is a cache; the lease set is the truth.
pub async fn reap_leases_once(
    state: &dyn StateStore,
    services: &ServiceCatalog,
) -> anyhow::Result<()> {
    for service in services.names() {
        let live = state.reap(service).await?;
        tracing::debug!(
            event = "conveyor.reconciler.reaped",
            service,
            live,
            "counter rewritten from lease keys"
        );
    }
    Ok(())
}

/// Fail RUNNING jobs with no progress for longer than `stuck_after`.
/// Returns how many jobs were failed.
pub async fn fail_stuck_jobs_once(
    store: &dyn JobStore,
    events: &EventPublisher,
    now: DateTime<Utc>,
    stuck_after: Duration,
) -> anyhow::Result<u64> {
    let cutoff = now - chrono::Duration::seconds(stuck_after.as_secs() as i64);
    let mut failed = 0u64;

    for mut job in store.list_stalled_running(cutoff).await? {
        if job.status != JobStatus::Running {
            continue;
        }
        job.fail(
            codes::STUCK_DETECTED,
            format!("No progress for more than {}s", stuck_after.as_secs()),
            true,
            now,
        );
        store.update(&job).await?;
        events
            .publish(
                job.id,
                &JobEvent::Error {
                    job_id: job.id,
                    error_code: codes::STUCK_DETECTED.to_string(),
                    message: "Job paused due to inactivity. You can resume.".to_string(),
                    action: ErrorAction::RetryAvailable,
                },
            )
            .await;
        tracing::info!(
            event = "conveyor.reconciler.stuck_job_failed",
            job_id = %job.id,
            "stuck job failed for resume"
        );
        failed += 1;
    }
    Ok(failed)
}

/// Promote waiting jobs one class up based on queue age. Returns how many
/// jobs were promoted.
pub async fn promote_waiting_jobs_once(
    store: &dyn JobStore,
    queue: &dyn JobQueue,
    events: &EventPublisher,
    now: DateTime<Utc>,
    cfg: &ReconcilerConfig,
) -> anyhow::Result<u64> {
    let low_cutoff = now - chrono::Duration::seconds(cfg.promote_low_after.as_secs() as i64);
    let medium_cutoff = now - chrono::Duration::seconds(cfg.promote_medium_after.as_secs() as i64);
    let mut promoted = 0u64;

    for mut job in store.list_promotable(low_cutoff, medium_cutoff).await? {
        let target = match job.priority {
            Priority::Low => Priority::Medium,
            // Jobs that started out high never decay, so this guard only
            // matters if a priority was lowered out-of-band.
            Priority::Medium if job.original_priority != Priority::High => Priority::High,
            _ => continue,
        };

        let old = job.priority;
        job.priority = target;
        job.promoted_at = Some(now);
        // Restart the aging clock in the new class.
        job.queued_at = now;
        job.touch(now);
        store.update(&job).await?;

        events
            .publish(
                job.id,
                &JobEvent::Promoted {
                    job_id: job.id,
                    old_priority: old,
                    new_priority: target,
                    message: format!("Priority raised from {old} to {target} after waiting"),
                },
            )
            .await;

        // A PENDING job is still sitting in its old queue; give it a fresh
        // entry in the new one. RUNNING jobs route on their next re-enqueue.
        if job.status == JobStatus::Pending {
            queue.enqueue(target, job.id).await?;
        }

        tracing::info!(
            event = "conveyor.reconciler.promoted",
            job_id = %job.id,
            old_priority = %old,
            new_priority = %target,
            "job promoted"
        );
        promoted += 1;
    }
    Ok(promoted)
}

pub async fn reaper_loop(
    state: Arc<dyn StateStore>,
    services: Arc<ServiceCatalog>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        if let Err(err) = reap_leases_once(state.as_ref(), &services).await {
            tracing::warn!(
                event = "conveyor.reconciler.reap.error",
                error = %err,
                "lease reap error"
            );
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

pub async fn stuck_job_loop(
    store: Arc<dyn JobStore>,
    events: EventPublisher,
    cfg: ReconcilerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        if let Err(err) =
            fail_stuck_jobs_once(store.as_ref(), &events, Utc::now(), cfg.stuck_after).await
        {
            tracing::warn!(
                event = "conveyor.reconciler.stuck.error",
                error = %err,
                "stuck-job sweep error"
            );
        }
        tokio::select! {
            _ = tokio::time::sleep(cfg.stuck_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

pub async fn promoter_loop(
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    events: EventPublisher,
    cfg: ReconcilerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        if let Err(err) =
            promote_waiting_jobs_once(store.as_ref(), queue.as_ref(), &events, Utc::now(), &cfg)
                .await
        {
            tracing::warn!(
                event = "conveyor.reconciler.promote.error",
                error = %err,
                "promotion sweep error"
            );
        }
        tokio::select! {
            _ = tokio::time::sleep(cfg.promote_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}
