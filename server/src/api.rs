//! HTTP request surface: job creation, resume, health.

use crate::priority::PriorityClient;
use crate::ws;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use conveyor_core::catalog::{FeatureCatalog, ServiceCatalog};
use conveyor_core::job::{Job, JobStatus, Priority};
use conveyor_core::{JobQueue, JobStore, StateStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub state: Arc<dyn StateStore>,
    pub queue: Arc<dyn JobQueue>,
    pub services: Arc<ServiceCatalog>,
    pub features: Arc<FeatureCatalog>,
    pub priority: PriorityClient,
    pub probe: reqwest::Client,
    /// Base URL advertised for the WebSocket monitor.
    pub monitor_base: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:job_id/resume", post(resume_job))
        .route("/api/v1/health", get(health))
        .route("/api/v1/health/services", get(health_services))
        .route("/ws/:job_id", get(ws::stream_events))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    pub feature_name: String,
    #[serde(default)]
    pub input_data: Value,
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct JobCreateResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub priority: Priority,
    pub monitor_url: String,
    pub status: JobStatus,
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartJobRequest>,
) -> ApiResult<(StatusCode, Json<JobCreateResponse>)> {
    if !state.features.contains(&req.feature_name) {
        return Err(ApiError::bad_request("unknown feature recipe"));
    }

    let priority = state.priority.user_priority(&req.user_id).await;
    let job = Job::new(
        Uuid::new_v4(),
        req.feature_name,
        req.input_data,
        Some(req.user_id),
        priority,
        Utc::now(),
    );

    state.store.insert(&job).await.map_err(ApiError::internal)?;
    state
        .queue
        .enqueue(priority, job.id)
        .await
        .map_err(ApiError::internal)?;

    tracing::info!(
        event = "conveyor.api.job_created",
        job_id = %job.id,
        feature = %job.feature_name,
        priority = %priority,
        "job created"
    );

    Ok((
        StatusCode::CREATED,
        Json(JobCreateResponse {
            success: true,
            job_id: job.id,
            priority,
            monitor_url: format!("{}/ws/{}", state.monitor_base.trim_end_matches('/'), job.id),
            status: JobStatus::Pending,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub previous_status: JobStatus,
    pub new_status: JobStatus,
    /// Service name of the next step, absent when the recipe was exhausted.
    pub resuming_from_step: Option<String>,
}

async fn resume_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<ResumeResponse>> {
    let Some(mut job) = state.store.get(job_id).await.map_err(ApiError::internal)? else {
        return Err(ApiError::not_found("job not found"));
    };
    let Some(recipe) = state.features.recipe(&job.feature_name) else {
        return Err(ApiError::bad_request("unknown feature recipe"));
    };

    let now = Utc::now();
    let previous_status = job.clear_failure(now);

    if (job.current_step_index as usize) >= recipe.len() {
        // Nothing left to run; close the job out instead of re-enqueueing.
        job.status = JobStatus::Completed;
        job.touch(now);
        state.store.update(&job).await.map_err(ApiError::internal)?;
        return Ok(Json(ResumeResponse {
            success: true,
            job_id,
            previous_status,
            new_status: JobStatus::Completed,
            resuming_from_step: None,
        }));
    }

    let next_step = recipe[job.current_step_index as usize].clone();
    state.store.update(&job).await.map_err(ApiError::internal)?;
    state
        .queue
        .enqueue(job.priority, job_id)
        .await
        .map_err(ApiError::internal)?;

    tracing::info!(
        event = "conveyor.api.job_resumed",
        job_id = %job_id,
        previous_status = %previous_status,
        next_step = %next_step,
        "job resumed"
    );

    Ok(Json(ResumeResponse {
        success: true,
        job_id,
        previous_status,
        new_status: JobStatus::Running,
        resuming_from_step: Some(next_step),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn health_services(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut out = serde_json::Map::new();
    for spec in state.services.iter() {
        let result = state
            .probe
            .get(spec.health_url())
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await;
        let entry = match result {
            Ok(resp) => json!({
                "ok": resp.status() == StatusCode::OK,
                "status_code": resp.status().as_u16(),
            }),
            Err(err) => json!({ "ok": false, "error": err.to_string() }),
        };
        out.insert(spec.name.clone(), entry);
    }
    Json(Value::Object(out))
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    pub fn bad_request(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    pub fn not_found(message: &'static str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(
            event = "conveyor.api.internal_error",
            error = %err,
            "api internal error"
        );
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
