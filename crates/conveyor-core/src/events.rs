//! Progress events published on the per-job channel `ws:{job_id}` and
//! relayed verbatim to WebSocket viewers.

use crate::job::Priority;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorAction {
    RetryAvailable,
    ContactSupport,
}

impl ErrorAction {
    pub fn for_retryable(retryable: bool) -> Self {
        if retryable {
            ErrorAction::RetryAvailable
        } else {
            ErrorAction::ContactSupport
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    #[serde(rename = "WS_CONNECTED")]
    Connected { job_id: Uuid },

    #[serde(rename = "WAITING_FOR_SLOT")]
    WaitingForSlot {
        job_id: Uuid,
        step_name: String,
        step_index: u32,
        total_steps: u32,
        message: String,
    },

    #[serde(rename = "STEP_STARTED")]
    StepStarted {
        job_id: Uuid,
        step_name: String,
        step_index: u32,
        total_steps: u32,
        message: String,
    },

    #[serde(rename = "STEP_COMPLETED")]
    StepCompleted {
        job_id: Uuid,
        step_name: String,
        step_index: u32,
        total_steps: u32,
        message: String,
    },

    #[serde(rename = "JOB_COMPLETED")]
    JobCompleted { job_id: Uuid, message: String },

    #[serde(rename = "JOB_ERROR")]
    Error {
        job_id: Uuid,
        error_code: String,
        message: String,
        action: ErrorAction,
    },

    #[serde(rename = "JOB_PROMOTED")]
    Promoted {
        job_id: Uuid,
        old_priority: Priority,
        new_priority: Priority,
        message: String,
    },
}

impl JobEvent {
    /// Wire value of the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Connected { .. } => "WS_CONNECTED",
            JobEvent::WaitingForSlot { .. } => "WAITING_FOR_SLOT",
            JobEvent::StepStarted { .. } => "STEP_STARTED",
            JobEvent::StepCompleted { .. } => "STEP_COMPLETED",
            JobEvent::JobCompleted { .. } => "JOB_COMPLETED",
            JobEvent::Error { .. } => "JOB_ERROR",
            JobEvent::Promoted { .. } => "JOB_PROMOTED",
        }
    }
}
