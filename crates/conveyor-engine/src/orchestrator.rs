//! The per-step state machine.
//!
//! [`Orchestrator::execute_one_step`] runs exactly one step of one job.
//! Concurrent invocations for the same job are tolerated only in the
//! benign-duplicate case (same step index, same idempotency key): the
//! backend de-duplicates on the idempotency key and the SUCCESS guard
//! short-circuits re-deliveries, so no cross-worker lock is held.

use crate::events::EventPublisher;
use crate::limiter::Limiter;
use crate::step_client::{ServiceOutput, StepClient};
use chrono::Utc;
use conveyor_core::catalog::{FeatureCatalog, ServiceCatalog, ServiceSpec};
use conveyor_core::envelope::{StepEnvelope, StepMeta, StepPayload};
use conveyor_core::error::{codes, ServiceCallError};
use conveyor_core::events::{ErrorAction, JobEvent};
use conveyor_core::job::{Job, JobStatus, StepRecord, StepStatus};
use conveyor_core::JobStore;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// One step committed; more may remain.
    Ok,
    /// The recipe was already exhausted; the job is now COMPLETED.
    Done,
    /// The current step had already succeeded; only the index advanced.
    SkippedAlreadyDone,
    /// A business failure was persisted onto the job.
    Failed,
    /// The job is in a terminal status and was left untouched.
    Stopped(JobStatus),
    JobNotFound,
}

impl StepOutcome {
    pub fn label(&self) -> String {
        match self {
            StepOutcome::Ok => "OK".to_string(),
            StepOutcome::Done => "DONE".to_string(),
            StepOutcome::SkippedAlreadyDone => "SKIPPED_ALREADY_DONE".to_string(),
            StepOutcome::Failed => "FAILED".to_string(),
            StepOutcome::Stopped(status) => format!("STOPPED_{status}"),
            StepOutcome::JobNotFound => "JOB_NOT_FOUND".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    limiter: Limiter,
    client: StepClient,
    events: EventPublisher,
    services: Arc<ServiceCatalog>,
    features: Arc<FeatureCatalog>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        limiter: Limiter,
        client: StepClient,
        events: EventPublisher,
        services: Arc<ServiceCatalog>,
        features: Arc<FeatureCatalog>,
    ) -> Self {
        Self {
            store,
            limiter,
            client,
            events,
            services,
            features,
        }
    }

    /// Run one step of `job_id`.
    ///
    /// `Err` is an infrastructure fault (store/KV transport); the caller
    /// retries it and the job row is left as-is. Every business failure is
    /// persisted and reported as `Ok(StepOutcome::Failed)`.
    pub async fn execute_one_step(&self, job_id: Uuid) -> anyhow::Result<StepOutcome> {
        let now = Utc::now();
        let Some(mut job) = self.store.get(job_id).await? else {
            return Ok(StepOutcome::JobNotFound);
        };
        if job.status.is_terminal() {
            return Ok(StepOutcome::Stopped(job.status));
        }

        let Some(recipe) = self.features.recipe(&job.feature_name) else {
            let message = format!("Unknown feature {}", job.feature_name);
            self.fail_job(&mut job, codes::INVALID_FEATURE, message, false)
                .await?;
            self.publish_error(&job, "Unknown feature").await;
            return Ok(StepOutcome::Failed);
        };
        let total_steps = recipe.len() as u32;

        if job.current_step_index >= total_steps {
            job.status = JobStatus::Completed;
            job.touch(now);
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
            return Ok(StepOutcome::Done);
        }

        let step_index = job.current_step_index;
        let service_name = recipe[step_index as usize].clone();
        let Some(spec) = self.services.get(&service_name).cloned() else {
            let message = format!(
                "Feature {} references unknown service {service_name}",
                job.feature_name
            );
            self.fail_job(&mut job, codes::UNKNOWN_SERVICE, message, false)
                .await?;
            self.publish_error(&job, "Unknown service").await;
            return Ok(StepOutcome::Failed);
        };

        // Idempotency guard: a re-delivered step that already committed only
        // advances the index.
        let already_done = job
            .context
            .step(step_index, &service_name)
            .map(|record| record.status == StepStatus::Success)
            .unwrap_or(false);
        if already_done {
            if !self.bump_step_index(&mut job).await? {
                self.fail_job(
                    &mut job,
                    codes::LOOP_DETECTED,
                    "Step index did not advance",
                    true,
                )
                .await?;
                return Ok(StepOutcome::Failed);
            }
            return Ok(StepOutcome::SkippedAlreadyDone);
        }

        let attempts = job.context.attempts(step_index, &service_name);
        if attempts >= spec.max_step_attempts {
            let message = format!(
                "Exceeded attempts for step_{step_index}_{service_name}"
            );
            self.fail_job(&mut job, codes::MAX_STEP_ATTEMPTS, message, false)
                .await?;
            self.publish_error(&job, "Exceeded attempts for step").await;
            return Ok(StepOutcome::Failed);
        }

        self.events
            .publish(
                job.id,
                &JobEvent::WaitingForSlot {
                    job_id: job.id,
                    step_name: service_name.clone(),
                    step_index,
                    total_steps,
                    message: "Waiting for capacity...".to_string(),
                },
            )
            .await;

        // The lease wait budget equals the per-service step timeout.
        let Some(token) = self
            .limiter
            .acquire(&service_name, spec.limit, spec.lease_ttl, spec.timeout)
            .await?
        else {
            let message = format!("Semaphore timeout after {}s", spec.timeout.as_secs());
            self.fail_job(&mut job, codes::RESOURCE_EXHAUSTED, message, true)
                .await?;
            self.publish_error(&job, "Service busy. Resume available.")
                .await;
            return Ok(StepOutcome::Failed);
        };

        let outcome = self
            .run_leased_step(&mut job, &spec, &service_name, step_index, total_steps, attempts)
            .await;

        // The lease is released on every path; a failed release is only
        // logged because the TTL and the reaper bound the leak.
        if let Err(err) = self.limiter.release(&service_name, &token).await {
            tracing::warn!(
                event = "conveyor.orchestrator.release_failed",
                job_id = %job.id,
                service = %service_name,
                error = %err,
                "lease release failed; reaper will repair the counter"
            );
        }

        outcome
    }

    async fn run_leased_step(
        &self,
        job: &mut Job,
        spec: &ServiceSpec,
        service_name: &str,
        step_index: u32,
        total_steps: u32,
        attempts: u32,
    ) -> anyhow::Result<StepOutcome> {
        let now = Utc::now();
        job.context
            .set_attempts(step_index, service_name, attempts + 1);
        job.status = JobStatus::Running;
        job.touch(now);
        self.store.update(job).await?;

        self.events
            .publish(
                job.id,
                &JobEvent::StepStarted {
                    job_id: job.id,
                    step_name: service_name.to_string(),
                    step_index,
                    total_steps,
                    message: format!("Running {service_name}..."),
                },
            )
            .await;

        let envelope = StepEnvelope {
            meta: StepMeta {
                job_id: job.id,
                step_index,
                service_name: service_name.to_string(),
                attempt: attempts + 1,
                timestamp: now.timestamp(),
            },
            payload: StepPayload {
                params: job.context.params().clone(),
                context: job.context.to_wire(),
            },
        };

        let started = tokio::time::Instant::now();
        match self.client.call(service_name, &envelope).await {
            Ok(output) => {
                self.commit_step(job, service_name, step_index, total_steps, output, started)
                    .await
            }
            Err(err) => {
                self.fail_step(job, err).await?;
                Ok(StepOutcome::Failed)
            }
        }
        // Infrastructure errors out of commit/fail propagate to the task
        // runtime; the step's work is still idempotent on re-delivery.
    }

    async fn commit_step(
        &self,
        job: &mut Job,
        service_name: &str,
        step_index: u32,
        total_steps: u32,
        output: ServiceOutput,
        started: tokio::time::Instant,
    ) -> anyhow::Result<StepOutcome> {
        let now = Utc::now();
        let mut metrics = output.metrics;
        metrics.insert(
            "execution_time_ms".to_string(),
            Value::from(started.elapsed().as_millis() as u64),
        );

        job.context.record_step(
            step_index,
            service_name,
            StepRecord {
                status: StepStatus::Success,
                data: output.data,
                metrics,
                timestamp: now.timestamp(),
            },
        );

        if !self.bump_step_index(job).await? {
            self.fail_job(job, codes::LOOP_DETECTED, "Step index did not advance", true)
                .await?;
            return Ok(StepOutcome::Failed);
        }

        self.events
            .publish(
                job.id,
                &JobEvent::StepCompleted {
                    job_id: job.id,
                    step_name: service_name.to_string(),
                    step_index,
                    total_steps,
                    message: format!("Completed {service_name}"),
                },
            )
            .await;
        Ok(StepOutcome::Ok)
    }

    async fn fail_step(&self, job: &mut Job, err: ServiceCallError) -> anyhow::Result<()> {
        let action = ErrorAction::for_retryable(err.retryable);
        self.fail_job(job, &err.code, err.message.clone(), err.retryable)
            .await?;
        self.events
            .publish(
                job.id,
                &JobEvent::Error {
                    job_id: job.id,
                    error_code: err.code,
                    message: err.message,
                    action,
                },
            )
            .await;
        Ok(())
    }

    /// Advance the step index and verify against the stored row that it
    /// strictly increased (a concurrent last-writer-wins update can clobber
    /// the bump).
    async fn bump_step_index(&self, job: &mut Job) -> anyhow::Result<bool> {
        let prev = job.current_step_index;
        job.current_step_index = prev + 1;
        job.mark_progress(Utc::now());
        self.store.update(job).await?;

        let stored = self.store.get(job.id).await?;
        Ok(stored
            .map(|row| row.current_step_index > prev)
            .unwrap_or(false))
    }

    async fn fail_job(
        &self,
        job: &mut Job,
        code: &str,
        message: impl Into<String>,
        retryable: bool,
    ) -> anyhow::Result<()> {
        let message = message.into();
        job.fail(code, message.clone(), retryable, Utc::now());
        self.store.update(job).await?;
        tracing::info!(
            event = "conveyor.orchestrator.step_failed",
            job_id = %job.id,
            code = code,
            retryable,
            "job failed: {message}"
        );
        Ok(())
    }

    async fn publish_error(&self, job: &Job, message: &str) {
        let code = job.error_code.clone().unwrap_or_default();
        let action = ErrorAction::for_retryable(job.retryable.unwrap_or(false));
        self.events
            .publish(
                job.id,
                &JobEvent::Error {
                    job_id: job.id,
                    error_code: code,
                    message: message.to_string(),
                    action,
                },
            )
            .await;
    }
}
