//! Shared fixtures for the engine tests: in-memory stores wired into an
//! orchestrator, plus a scriptable backend service bound on 127.0.0.1:0.
#![allow(dead_code)]

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use conveyor_core::catalog::{FeatureCatalog, ServiceAuth, ServiceCatalog, ServiceSpec};
use conveyor_core::memory::{MemoryJobQueue, MemoryJobStore, MemoryStateStore};
use conveyor_engine::events::EventPublisher;
use conveyor_engine::limiter::Limiter;
use conveyor_engine::orchestrator::Orchestrator;
use conveyor_engine::step_client::{StepClient, StepClientConfig};
use conveyor_engine::worker::{Worker, WorkerConfig};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_API_KEY: &str = "test-internal-key";

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Always `{status: SUCCESS, data, metrics: {latency_ms: 5}}`.
    Success(Value),
    /// The first `times` hits return `status` with no body, then succeed.
    FailStatusTimes { times: usize, status: u16 },
    AlwaysStatus(u16),
    /// 200 with a non-JSON body.
    RawText(&'static str),
    /// Sleep before answering success.
    Hang(Duration),
}

pub struct Backend {
    pub hits: AtomicUsize,
    pub last_envelope: Mutex<Option<Value>>,
    pub idempotency_keys: Mutex<Vec<String>>,
    behavior: Behavior,
}

async fn execute(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(envelope): Json<Value>,
) -> Response {
    let hit = backend.hits.fetch_add(1, Ordering::SeqCst);
    if let Some(key) = headers.get("Idempotency-Key").and_then(|v| v.to_str().ok()) {
        backend
            .idempotency_keys
            .lock()
            .unwrap()
            .push(key.to_string());
    }
    *backend.last_envelope.lock().unwrap() = Some(envelope);

    let success = |data: &Value| {
        Json(json!({
            "status": "SUCCESS",
            "data": data,
            "metrics": {"latency_ms": 5},
        }))
        .into_response()
    };

    match &backend.behavior {
        Behavior::Success(data) => success(data),
        Behavior::FailStatusTimes { times, status } => {
            if hit < *times {
                StatusCode::from_u16(*status).unwrap().into_response()
            } else {
                success(&json!({"ok": true}))
            }
        }
        Behavior::AlwaysStatus(status) => StatusCode::from_u16(*status).unwrap().into_response(),
        Behavior::RawText(text) => (StatusCode::OK, *text).into_response(),
        Behavior::Hang(delay) => {
            tokio::time::sleep(*delay).await;
            success(&json!({"ok": true}))
        }
    }
}

/// Spawn the fake backend; returns its base URL and handle.
pub async fn spawn_backend(behavior: Behavior) -> anyhow::Result<(String, Arc<Backend>)> {
    let backend = Arc::new(Backend {
        hits: AtomicUsize::new(0),
        last_envelope: Mutex::new(None),
        idempotency_keys: Mutex::new(Vec::new()),
        behavior,
    });
    let app = Router::new()
        .route("/v1/execute", post(execute))
        .with_state(backend.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });
    Ok((format!("http://{addr}"), backend))
}

pub fn test_spec(name: &str, base_url: &str) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        limit: 5,
        timeout: Duration::from_secs(5),
        lease_ttl: Duration::from_secs(30),
        max_step_attempts: 3,
        base_url: base_url.to_string(),
        execute_path: "/v1/execute".to_string(),
        health_path: "/health".to_string(),
        auth: ServiceAuth::ApiKeyHeader {
            header: "X-Internal-Key".to_string(),
        },
    }
}

pub struct Harness {
    pub state: Arc<MemoryStateStore>,
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub services: Arc<ServiceCatalog>,
    pub features: Arc<FeatureCatalog>,
    pub events: EventPublisher,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(specs: Vec<ServiceSpec>, features: FeatureCatalog) -> anyhow::Result<Self> {
        let state = Arc::new(MemoryStateStore::new());
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let services = Arc::new(ServiceCatalog::new(specs));
        let features = Arc::new(features);

        let client = StepClient::new(
            services.clone(),
            StepClientConfig {
                connect_timeout: Duration::from_secs(1),
                read_timeout_cap: Duration::from_secs(10),
                internal_api_key: TEST_API_KEY.to_string(),
            },
        )?;
        let events = EventPublisher::new(state.clone());
        let orchestrator = Orchestrator::new(
            store.clone(),
            Limiter::new(state.clone()),
            client,
            events.clone(),
            services.clone(),
            features.clone(),
        );

        Ok(Self {
            state,
            store,
            queue,
            services,
            features,
            events,
            orchestrator,
        })
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            self.orchestrator.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.features.clone(),
            self.events.clone(),
            WorkerConfig {
                poll_interval: Duration::from_millis(20),
                infra_retry_max: 3,
                infra_retry_base: Duration::from_millis(10),
            },
        )
    }
}

/// Drain everything currently buffered on an event subscription and return
/// the parsed payloads.
pub fn drain_events(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(raw) = rx.try_recv() {
        if let Ok(value) = serde_json::from_str(&raw) {
            events.push(value);
        }
    }
    events
}

pub fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| e["type"].as_str().map(str::to_string))
        .collect()
}
