//! Task runtime adapter: consumes job-ids from the priority queues and
//! drives the orchestrator.
//!
//! Business failures are not retried here; they leave the job FAILED and
//! awaiting an explicit resume. Infrastructure faults are retried with
//! exponential backoff before the message is given up on, at which point the
//! stuck-job detector is the safety net.

use crate::events::EventPublisher;
use crate::orchestrator::{Orchestrator, StepOutcome};
use chrono::Utc;
use conveyor_core::catalog::FeatureCatalog;
use conveyor_core::events::JobEvent;
use conveyor_core::job::JobStatus;
use conveyor_core::{JobQueue, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when every queue is empty.
    pub poll_interval: Duration,
    pub infra_retry_max: u32,
    /// First backoff delay; doubles per retry.
    pub infra_retry_base: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            infra_retry_max: 10,
            infra_retry_base: Duration::from_secs(3),
        }
    }
}

pub struct Worker {
    orchestrator: Orchestrator,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    features: Arc<FeatureCatalog>,
    events: EventPublisher,
    cfg: WorkerConfig,
}

impl Worker {
    pub fn new(
        orchestrator: Orchestrator,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        features: Arc<FeatureCatalog>,
        events: EventPublisher,
        cfg: WorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            queue,
            features,
            events,
            cfg,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(event = "conveyor.worker.started", "worker started");
        loop {
            if *shutdown.borrow() {
                tracing::info!(event = "conveyor.worker.shutdown", "worker shutting down");
                return Ok(());
            }

            let popped = match self.queue.pop().await {
                Ok(popped) => popped,
                Err(err) => {
                    tracing::warn!(
                        event = "conveyor.worker.pop.error",
                        error = %err,
                        "queue pop failed"
                    );
                    tokio::time::sleep(self.cfg.poll_interval).await;
                    continue;
                }
            };

            let Some(item) = popped else {
                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            if let Err(err) = self.run_job_step(item.job_id).await {
                tracing::warn!(
                    event = "conveyor.worker.step.gave_up",
                    job_id = %item.job_id,
                    error = %err,
                    "step abandoned after infrastructure retries"
                );
            }
        }
    }

    /// Process one queue message: run the step (with infra retry) and route
    /// the outcome.
    pub async fn run_job_step(&self, job_id: Uuid) -> anyhow::Result<StepOutcome> {
        let outcome = self.execute_with_retry(job_id).await?;
        tracing::debug!(
            event = "conveyor.worker.step.outcome",
            job_id = %job_id,
            outcome = %outcome.label(),
            "step finished"
        );

        if matches!(outcome, StepOutcome::Ok | StepOutcome::SkippedAlreadyDone) {
            self.route_next(job_id).await?;
        }
        Ok(outcome)
    }

    async fn execute_with_retry(&self, job_id: Uuid) -> anyhow::Result<StepOutcome> {
        let mut delay = self.cfg.infra_retry_base;
        let mut attempt = 0u32;
        loop {
            match self.orchestrator.execute_one_step(job_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.cfg.infra_retry_max {
                        return Err(err);
                    }
                    tracing::warn!(
                        event = "conveyor.worker.step.infra_retry",
                        job_id = %job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying step after infrastructure error"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    /// After a committed (or skipped) step: re-enqueue while steps remain on
    /// the queue matching the job's current priority, otherwise complete.
    async fn route_next(&self, job_id: Uuid) -> anyhow::Result<()> {
        let Some(mut job) = self.store.get(job_id).await? else {
            return Ok(());
        };
        let Some(recipe) = self.features.recipe(&job.feature_name) else {
            return Ok(());
        };

        if (job.current_step_index as usize) < recipe.len() {
            self.queue.enqueue(job.priority, job.id).await?;
            return Ok(());
        }

        job.status = JobStatus::Completed;
        job.touch(Utc::now());
        self.store.update(&job).await?;
        self.events
            .publish(
                job.id,
                &JobEvent::JobCompleted {
                    job_id: job.id,
                    message: "Job completed".to_string(),
                },
            )
            .await;
        tracing::info!(
            event = "conveyor.worker.job_completed",
            job_id = %job.id,
            feature = %job.feature_name,
            "job completed"
        );
        Ok(())
    }
}
