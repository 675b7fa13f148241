mod support;

use chrono::{Duration as ChronoDuration, Utc};
use conveyor_core::catalog::ServiceCatalog;
use conveyor_core::error::codes;
use conveyor_core::job::{Job, JobStatus, Priority};
use conveyor_core::memory::{MemoryJobQueue, MemoryJobStore, MemoryStateStore};
use conveyor_core::{JobStore, StateStore};
use conveyor_engine::events::EventPublisher;
use conveyor_engine::reconciler::{
    fail_stuck_jobs_once, promote_waiting_jobs_once, reap_leases_once, ReconcilerConfig,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{drain_events, test_spec};
use uuid::Uuid;

fn job_with(priority: Priority, status: JobStatus, queued_secs_ago: i64) -> Job {
    let now = Utc::now();
    let mut job = Job::new(
        Uuid::new_v4(),
        "business_plan",
        json!({}),
        None,
        priority,
        now - ChronoDuration::seconds(queued_secs_ago),
    );
    job.status = status;
    job
}

#[tokio::test]
async fn reaper_rewrites_counter_from_surviving_leases() -> anyhow::Result<()> {
    let state = Arc::new(MemoryStateStore::new());
    let services = ServiceCatalog::new(vec![test_spec("alpha", "http://unused:9000")]);

    let crashed = state
        .try_acquire("alpha", 2, Duration::from_secs(30))
        .await?
        .unwrap();
    let _held = state
        .try_acquire("alpha", 2, Duration::from_secs(30))
        .await?
        .unwrap();
    anyhow::ensure!(state.concurrency("alpha").await? == 2);

    // Crash one holder: its lease key disappears but the counter stays.
    state.expire_lease("alpha", &crashed);
    anyhow::ensure!(state.concurrency("alpha").await? == 2, "drift before reap");

    reap_leases_once(state.as_ref(), &services).await?;
    anyhow::ensure!(
        state.concurrency("alpha").await? == 1,
        "counter equals surviving lease cardinality"
    );
    anyhow::ensure!(state.lease_count("alpha").await? == 1);
    Ok(())
}

#[tokio::test]
async fn stuck_running_jobs_are_failed_for_resume() -> anyhow::Result<()> {
    let store = Arc::new(MemoryJobStore::new());
    let state = Arc::new(MemoryStateStore::new());
    let events = EventPublisher::new(state.clone());
    let now = Utc::now();
    let stuck_after = Duration::from_secs(7200);

    let mut stuck = job_with(Priority::Medium, JobStatus::Running, 0);
    stuck.last_progress_at = now - ChronoDuration::seconds(3 * 3600);
    let mut events_rx = state.subscribe(&format!("ws:{}", stuck.id)).await?;
    store.insert(&stuck).await?;

    let mut fresh = job_with(Priority::Medium, JobStatus::Running, 0);
    fresh.last_progress_at = now;
    store.insert(&fresh).await?;

    let failed = fail_stuck_jobs_once(store.as_ref(), &events, now, stuck_after).await?;
    anyhow::ensure!(failed == 1, "exactly the stalled job fails, got {failed}");

    let row = store.get(stuck.id).await?.expect("job exists");
    anyhow::ensure!(row.status == JobStatus::Failed);
    anyhow::ensure!(row.error_code.as_deref() == Some(codes::STUCK_DETECTED));
    anyhow::ensure!(row.retryable == Some(true));

    let untouched = store.get(fresh.id).await?.expect("job exists");
    anyhow::ensure!(untouched.status == JobStatus::Running);

    let published = drain_events(&mut events_rx);
    let error_event = published
        .iter()
        .find(|e| e["type"] == "JOB_ERROR")
        .expect("stuck event published");
    anyhow::ensure!(error_event["error_code"] == "STUCK_DETECTED");
    anyhow::ensure!(error_event["action"] == "RETRY_AVAILABLE");
    Ok(())
}

#[tokio::test]
async fn promoter_upgrades_aged_jobs_and_requeues_pending() -> anyhow::Result<()> {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let state = Arc::new(MemoryStateStore::new());
    let events = EventPublisher::new(state.clone());
    let cfg = ReconcilerConfig::default();
    let now = Utc::now();

    // Aged out of `low`, still PENDING: promote + re-enqueue.
    let aged_low = job_with(Priority::Low, JobStatus::Pending, 1801);
    let mut low_events = state.subscribe(&format!("ws:{}", aged_low.id)).await?;
    store.insert(&aged_low).await?;

    // Aged out of `medium`, originally medium: promote to high.
    let aged_medium = job_with(Priority::Medium, JobStatus::Pending, 3601);
    store.insert(&aged_medium).await?;

    // Originally high, later observed at medium: never promoted to high.
    let mut demoted_high = job_with(Priority::High, JobStatus::Pending, 3601);
    demoted_high.priority = Priority::Medium;
    store.insert(&demoted_high).await?;

    // RUNNING jobs are promoted but not re-enqueued.
    let running_low = job_with(Priority::Low, JobStatus::Running, 1801);
    store.insert(&running_low).await?;

    // Too young to promote.
    let young_low = job_with(Priority::Low, JobStatus::Pending, 60);
    store.insert(&young_low).await?;

    let promoted =
        promote_waiting_jobs_once(store.as_ref(), queue.as_ref(), &events, now, &cfg).await?;
    anyhow::ensure!(promoted == 3, "expected 3 promotions, got {promoted}");

    let low_row = store.get(aged_low.id).await?.expect("job exists");
    anyhow::ensure!(low_row.priority == Priority::Medium);
    anyhow::ensure!(low_row.promoted_at == Some(now));
    anyhow::ensure!(low_row.queued_at == now, "aging clock restarts");

    let medium_row = store.get(aged_medium.id).await?.expect("job exists");
    anyhow::ensure!(medium_row.priority == Priority::High);

    let blocked_row = store.get(demoted_high.id).await?.expect("job exists");
    anyhow::ensure!(
        blocked_row.priority == Priority::Medium,
        "high-origin jobs are not promoted to high"
    );
    anyhow::ensure!(blocked_row.promoted_at.is_none());

    let running_row = store.get(running_low.id).await?.expect("job exists");
    anyhow::ensure!(running_row.priority == Priority::Medium);

    let young_row = store.get(young_low.id).await?.expect("job exists");
    anyhow::ensure!(young_row.priority == Priority::Low);

    anyhow::ensure!(
        queue.depth(Priority::Medium) + queue.depth(Priority::High) == 2,
        "only PENDING promotees re-enqueue"
    );

    let published = drain_events(&mut low_events);
    let promoted_event = published
        .iter()
        .find(|e| e["type"] == "JOB_PROMOTED")
        .expect("promotion event published");
    anyhow::ensure!(promoted_event["old_priority"] == "low");
    anyhow::ensure!(promoted_event["new_priority"] == "medium");
    Ok(())
}

#[tokio::test]
async fn promoter_is_quiet_when_nothing_qualifies() -> anyhow::Result<()> {
    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryJobQueue::new());
    let state = Arc::new(MemoryStateStore::new());
    let events = EventPublisher::new(state.clone());
    let cfg = ReconcilerConfig::default();

    let completed = job_with(Priority::Low, JobStatus::Completed, 4000);
    store.insert(&completed).await?;

    let promoted =
        promote_waiting_jobs_once(store.as_ref(), queue.as_ref(), &events, Utc::now(), &cfg)
            .await?;
    anyhow::ensure!(promoted == 0, "terminal jobs never promote");

    let row = store.get(completed.id).await?.expect("job exists");
    anyhow::ensure!(row.priority == Priority::Low && row.promoted_at.is_none());
    Ok(())
}

#[tokio::test]
async fn catalog_unused_in_reap_has_zero_counters() -> anyhow::Result<()> {
    let state = Arc::new(MemoryStateStore::new());
    let services = ServiceCatalog::new(vec![
        test_spec("alpha", "http://unused:9000"),
        test_spec("beta", "http://unused:9000"),
    ]);

    reap_leases_once(state.as_ref(), &services).await?;
    anyhow::ensure!(state.concurrency("alpha").await? == 0);
    anyhow::ensure!(state.concurrency("beta").await? == 0);
    Ok(())
}
