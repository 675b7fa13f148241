//! Fire-and-forget progress publishing onto the per-job channel.

use conveyor_core::events::JobEvent;
use conveyor_core::StateStore;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct EventPublisher {
    state: Arc<dyn StateStore>,
}

impl EventPublisher {
    pub fn new(state: Arc<dyn StateStore>) -> Self {
        Self { state }
    }

    pub fn channel(job_id: Uuid) -> String {
        format!("ws:{job_id}")
    }

    /// Publish failures never fail a step; they are logged and dropped.
    pub async fn publish(&self, job_id: Uuid, event: &JobEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(
                    event = "conveyor.events.encode_failed",
                    job_id = %job_id,
                    error = %err,
                    "dropping unencodable progress event"
                );
                return;
            }
        };

        if let Err(err) = self.state.publish(&Self::channel(job_id), &payload).await {
            tracing::warn!(
                event = "conveyor.events.publish_failed",
                job_id = %job_id,
                kind = event.kind(),
                error = %err,
                "dropping progress event"
            );
        }
    }
}
