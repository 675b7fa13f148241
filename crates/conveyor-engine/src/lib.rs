//! The conveyor core subsystem: concurrency limiter, HTTP step client, step
//! orchestrator, task runtime worker, and periodic reconcilers.
//!
//! Error discipline across this crate: business failures (unknown feature,
//! attempt cap, backend errors, lease wait timeout) are persisted onto the
//! job row and reported through the returned [`orchestrator::StepOutcome`];
//! infrastructure faults (DB/KV transport) surface as `Err` and are retried
//! by the task runtime without marking the job failed.

pub mod events;
pub mod limiter;
pub mod orchestrator;
pub mod reconciler;
pub mod step_client;
pub mod worker;
