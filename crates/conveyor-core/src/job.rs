//! Job model: the durable row, status/priority enums, and the typed context
//! bag.
//!
//! The context is stored as JSON with the wire keys `params`,
//! `step_{i}_{service}` and `step_{i}_{service}__attempts`. In code it is a
//! typed map of [`StepRecord`]s plus an attempts sidecar; serde preserves the
//! wire shape so rows written by older deployments round-trip unchanged.

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Failed,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Failed => "FAILED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "FAILED" => Some(JobStatus::Failed),
            "COMPLETED" => Some(JobStatus::Completed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses admit no further mutations.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Drain order for workers: higher queues before lower.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }

    /// Queue list key for this priority class.
    pub fn queue(&self) -> &'static str {
        match self {
            Priority::High => "high_priority",
            Priority::Medium => "medium_priority",
            Priority::Low => "low_priority",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    #[serde(rename = "SUCCESS")]
    Success,
}

/// Payload of a committed step, stored under `step_{i}_{service}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Wire key for the step at `index` executing `service`.
pub fn step_key(index: u32, service: &str) -> String {
    format!("step_{index}_{service}")
}

const ATTEMPTS_SUFFIX: &str = "__attempts";

/// Typed view of the job context bag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobContext {
    params: Value,
    steps: BTreeMap<String, StepRecord>,
    attempts: BTreeMap<String, u32>,
    /// Keys we do not interpret; preserved verbatim across round-trips.
    extra: BTreeMap<String, Value>,
}

impl JobContext {
    pub fn new(params: Value) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    /// Caller-supplied input; read-only to the orchestrator.
    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn step(&self, index: u32, service: &str) -> Option<&StepRecord> {
        self.steps.get(&step_key(index, service))
    }

    pub fn record_step(&mut self, index: u32, service: &str, record: StepRecord) {
        self.steps.insert(step_key(index, service), record);
    }

    pub fn attempts(&self, index: u32, service: &str) -> u32 {
        self.attempts
            .get(&step_key(index, service))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_attempts(&mut self, index: u32, service: &str, attempts: u32) {
        self.attempts.insert(step_key(index, service), attempts);
    }

    /// Completed-step records in wire-key order.
    pub fn steps(&self) -> impl Iterator<Item = (&str, &StepRecord)> {
        self.steps.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The full context in its wire shape, as sent to backends in the step
    /// envelope and stored in the job row.
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Serialize for JobContext {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut entries = self.steps.len() + self.attempts.len() + self.extra.len();
        if !self.params.is_null() {
            entries += 1;
        }
        let mut map = serializer.serialize_map(Some(entries))?;
        if !self.params.is_null() {
            map.serialize_entry("params", &self.params)?;
        }
        for (key, record) in &self.steps {
            map.serialize_entry(key, record)?;
        }
        for (key, attempts) in &self.attempts {
            map.serialize_entry(&format!("{key}{ATTEMPTS_SUFFIX}"), attempts)?;
        }
        for (key, value) in &self.extra {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for JobContext {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ContextVisitor;

        impl<'de> Visitor<'de> for ContextVisitor {
            type Value = JobContext;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a job context object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<JobContext, A::Error> {
                let mut ctx = JobContext::default();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    if key == "params" {
                        ctx.params = value;
                        continue;
                    }
                    if let Some(step) = key.strip_suffix(ATTEMPTS_SUFFIX) {
                        if step.starts_with("step_") {
                            if let Some(n) = value.as_u64() {
                                ctx.attempts.insert(step.to_string(), n as u32);
                                continue;
                            }
                        }
                    }
                    if key.starts_with("step_") {
                        // Unparseable step payloads fall through to `extra`.
                        if let Ok(record) = serde_json::from_value::<StepRecord>(value.clone()) {
                            ctx.steps.insert(key, record);
                            continue;
                        }
                    }
                    ctx.extra.insert(key, value);
                }
                Ok(ctx)
            }
        }

        deserializer.deserialize_map(ContextVisitor)
    }
}

/// Durable job row.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub feature_name: String,
    pub status: JobStatus,
    pub current_step_index: u32,
    pub context: JobContext,
    pub error_code: Option<String>,
    pub error_log: Option<String>,
    pub retryable: Option<bool>,
    pub priority: Priority,
    pub original_priority: Priority,
    pub user_id: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: Uuid,
        feature_name: impl Into<String>,
        params: Value,
        user_id: Option<String>,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            feature_name: feature_name.into(),
            status: JobStatus::Pending,
            current_step_index: 0,
            context: JobContext::new(params),
            error_code: None,
            error_log: None,
            retryable: None,
            priority,
            original_priority: priority,
            user_id,
            queued_at: now,
            promoted_at: None,
            created_at: now,
            updated_at: now,
            last_progress_at: now,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    pub fn mark_progress(&mut self, now: DateTime<Utc>) {
        self.last_progress_at = now;
        self.updated_at = now;
    }

    /// Record a business failure. The failure triple is non-null iff the
    /// status is FAILED.
    pub fn fail(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
        now: DateTime<Utc>,
    ) {
        self.status = JobStatus::Failed;
        self.error_code = Some(code.into());
        self.error_log = Some(message.into());
        self.retryable = Some(retryable);
        self.updated_at = now;
    }

    /// Clear failure fields and move to RUNNING; returns the previous status.
    pub fn clear_failure(&mut self, now: DateTime<Utc>) -> JobStatus {
        let prev = self.status;
        self.status = JobStatus::Running;
        self.error_code = None;
        self.error_log = None;
        self.retryable = None;
        self.updated_at = now;
        prev
    }
}
