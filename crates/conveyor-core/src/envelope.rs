//! Request envelope sent to backend services for one step.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEnvelope {
    pub meta: StepMeta,
    pub payload: StepPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMeta {
    pub job_id: Uuid,
    pub step_index: u32,
    pub service_name: String,
    /// 1-based attempt number for this step.
    pub attempt: u32,
    /// Unix seconds.
    pub timestamp: i64,
}

impl StepMeta {
    /// Deterministic tag backends use to de-duplicate deliveries.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.job_id, self.step_index, self.service_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPayload {
    /// Caller-supplied input, passed through unchanged.
    #[serde(default)]
    pub params: Value,
    /// Full context bag in wire shape, including prior step outputs.
    #[serde(default)]
    pub context: Value,
}
