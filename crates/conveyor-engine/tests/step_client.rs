mod support;

use conveyor_core::catalog::ServiceCatalog;
use conveyor_core::envelope::{StepEnvelope, StepMeta, StepPayload};
use conveyor_core::error::codes;
use conveyor_engine::step_client::{StepClient, StepClientConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{spawn_backend, test_spec, Behavior};
use uuid::Uuid;

fn envelope(service: &str) -> StepEnvelope {
    StepEnvelope {
        meta: StepMeta {
            job_id: Uuid::new_v4(),
            step_index: 0,
            service_name: service.to_string(),
            attempt: 1,
            timestamp: 0,
        },
        payload: StepPayload {
            params: json!({}),
            context: json!({}),
        },
    }
}

fn client(services: ServiceCatalog, read_timeout_cap: Duration) -> anyhow::Result<StepClient> {
    StepClient::new(
        Arc::new(services),
        StepClientConfig {
            connect_timeout: Duration::from_secs(1),
            read_timeout_cap,
            internal_api_key: String::new(),
        },
    )
}

#[tokio::test]
async fn slow_backend_classifies_as_service_timeout() -> anyhow::Result<()> {
    let (base_url, _backend) = spawn_backend(Behavior::Hang(Duration::from_secs(5))).await?;
    let mut spec = test_spec("alpha", &base_url);
    spec.timeout = Duration::from_millis(200);
    let client = client(ServiceCatalog::new(vec![spec]), Duration::from_secs(10))?;

    let err = client
        .call("alpha", &envelope("alpha"))
        .await
        .expect_err("must time out");
    anyhow::ensure!(err.code == codes::SERVICE_TIMEOUT, "got {}", err.code);
    anyhow::ensure!(err.retryable);
    Ok(())
}

#[tokio::test]
async fn read_timeout_is_capped_globally() -> anyhow::Result<()> {
    let (base_url, _backend) = spawn_backend(Behavior::Hang(Duration::from_secs(5))).await?;
    // Generous per-service timeout, tight global cap: the cap wins.
    let mut spec = test_spec("alpha", &base_url);
    spec.timeout = Duration::from_secs(600);
    let client = client(ServiceCatalog::new(vec![spec]), Duration::from_millis(200))?;

    let err = client
        .call("alpha", &envelope("alpha"))
        .await
        .expect_err("must time out");
    anyhow::ensure!(err.code == codes::SERVICE_TIMEOUT);
    Ok(())
}

#[tokio::test]
async fn connection_refused_is_service_unreachable() -> anyhow::Result<()> {
    // Port 1 is unassigned; connects fail fast.
    let spec = test_spec("alpha", "http://127.0.0.1:1");
    let client = client(ServiceCatalog::new(vec![spec]), Duration::from_secs(10))?;

    let err = client
        .call("alpha", &envelope("alpha"))
        .await
        .expect_err("must be unreachable");
    anyhow::ensure!(err.code == codes::SERVICE_UNREACHABLE, "got {}", err.code);
    anyhow::ensure!(err.retryable);
    Ok(())
}

#[tokio::test]
async fn non_json_success_body_is_bad_response() -> anyhow::Result<()> {
    let (base_url, _backend) = spawn_backend(Behavior::RawText("pong")).await?;
    let spec = test_spec("alpha", &base_url);
    let client = client(ServiceCatalog::new(vec![spec]), Duration::from_secs(10))?;

    let err = client
        .call("alpha", &envelope("alpha"))
        .await
        .expect_err("non-JSON body must be rejected");
    anyhow::ensure!(err.code == codes::BAD_RESPONSE);
    anyhow::ensure!(err.retryable);
    Ok(())
}

#[tokio::test]
async fn unconfigured_service_is_rejected_without_io() -> anyhow::Result<()> {
    let client = client(ServiceCatalog::default(), Duration::from_secs(10))?;
    let err = client
        .call("ghost", &envelope("ghost"))
        .await
        .expect_err("unknown service");
    anyhow::ensure!(err.code == codes::UNKNOWN_SERVICE);
    anyhow::ensure!(!err.retryable);
    Ok(())
}

#[tokio::test]
async fn success_returns_data_and_metrics() -> anyhow::Result<()> {
    let (base_url, backend) = spawn_backend(Behavior::Success(json!({"answer": 42}))).await?;
    let spec = test_spec("alpha", &base_url);
    let client = client(ServiceCatalog::new(vec![spec]), Duration::from_secs(10))?;

    let out = client.call("alpha", &envelope("alpha")).await.expect("success");
    anyhow::ensure!(out.data == json!({"answer": 42}));
    anyhow::ensure!(out.metrics.get("latency_ms") == Some(&json!(5)));
    anyhow::ensure!(backend.hits.load(std::sync::atomic::Ordering::SeqCst) == 1);
    Ok(())
}
