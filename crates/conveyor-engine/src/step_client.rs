//! HTTP client for backend service calls.
//!
//! Posts the step envelope to `base_url + execute_path` with the
//! deterministic `Idempotency-Key` and classifies the response per the error
//! taxonomy. Classification is pure over (status, parsed body) so the table
//! is unit-testable without a live server.

use anyhow::Context;
use conveyor_core::catalog::{ServiceAuth, ServiceCatalog};
use conveyor_core::envelope::StepEnvelope;
use conveyor_core::error::{codes, ServiceCallError};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone)]
pub struct StepClientConfig {
    pub connect_timeout: Duration,
    /// Upper bound on the per-call read timeout regardless of the service's
    /// configured step timeout.
    pub read_timeout_cap: Duration,
    pub internal_api_key: String,
}

#[derive(Clone)]
pub struct StepClient {
    http: reqwest::Client,
    services: Arc<ServiceCatalog>,
    cfg: StepClientConfig,
}

/// Validated success payload from a backend.
#[derive(Debug, Clone)]
pub struct ServiceOutput {
    pub data: Value,
    pub metrics: Map<String, Value>,
}

impl StepClient {
    pub fn new(services: Arc<ServiceCatalog>, cfg: StepClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .build()
            .context("build step http client")?;
        Ok(Self {
            http,
            services,
            cfg,
        })
    }

    pub async fn call(
        &self,
        service: &str,
        envelope: &StepEnvelope,
    ) -> Result<ServiceOutput, ServiceCallError> {
        let Some(spec) = self.services.get(service) else {
            return Err(ServiceCallError::new(
                codes::UNKNOWN_SERVICE,
                format!("no service config for {service}"),
                false,
            ));
        };

        let read_timeout = spec.timeout.min(self.cfg.read_timeout_cap);
        let mut request = self
            .http
            .post(spec.execute_url())
            .timeout(read_timeout)
            .header(IDEMPOTENCY_KEY_HEADER, envelope.meta.idempotency_key())
            .json(envelope);
        request = match &spec.auth {
            ServiceAuth::ApiKeyHeader { header } if !self.cfg.internal_api_key.is_empty() => {
                request.header(header, &self.cfg.internal_api_key)
            }
            ServiceAuth::Bearer if !self.cfg.internal_api_key.is_empty() => {
                request.bearer_auth(&self.cfg.internal_api_key)
            }
            _ => request,
        };

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(transport_error)?;
        let body: Option<Value> = serde_json::from_slice(&bytes).ok();

        if !(200..300).contains(&status) {
            return Err(classify_http_failure(status, body));
        }
        parse_success(service, body)
    }
}

fn transport_error(err: reqwest::Error) -> ServiceCallError {
    if err.is_timeout() {
        ServiceCallError::new(codes::SERVICE_TIMEOUT, err.to_string(), true)
    } else {
        ServiceCallError::new(codes::SERVICE_UNREACHABLE, err.to_string(), true)
    }
}

/// Non-2xx classification. 429/503 always map to the shared busy code; other
/// statuses take the error from a well-formed failure body when present.
pub fn classify_http_failure(status: u16, body: Option<Value>) -> ServiceCallError {
    let mut err = error_from_body(status, body);
    if status == 429 || status == 503 {
        err.code = codes::RESOURCE_EXHAUSTED.to_string();
        err.retryable = true;
    }
    err
}

fn error_from_body(status: u16, body: Option<Value>) -> ServiceCallError {
    let server_side = status >= 500;

    if let Some(body) = &body {
        let is_failed = body.get("status").and_then(Value::as_str) == Some("FAILED");
        if let Some(error) = body.get("error").filter(|e| e.is_object()) {
            if is_failed {
                let code = error
                    .get("code")
                    .and_then(Value::as_str)
                    .unwrap_or(codes::SERVICE_HTTP_ERROR);
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("service returned HTTP {status}"));
                let retryable = error
                    .get("retryable")
                    .and_then(Value::as_bool)
                    .unwrap_or(server_side);
                return ServiceCallError::new(code, message, retryable)
                    .with_details(error.clone());
            }
        }
    }

    let mut err = ServiceCallError::new(
        codes::SERVICE_HTTP_ERROR,
        format!("service returned HTTP {status}"),
        server_side,
    );
    if let Some(body) = body.filter(Value::is_object) {
        err = err.with_details(body);
    }
    err
}

/// 2xx classification: the body must be JSON with `status = SUCCESS` and an
/// object `data` field; `metrics` defaults to empty and must be an object
/// when present.
pub fn parse_success(service: &str, body: Option<Value>) -> Result<ServiceOutput, ServiceCallError> {
    let Some(mut body) = body else {
        return Err(ServiceCallError::new(
            codes::BAD_RESPONSE,
            "service returned non-JSON",
            true,
        ));
    };

    if body.get("status").and_then(Value::as_str) != Some("SUCCESS") {
        let error = body.get("error").cloned().unwrap_or(Value::Null);
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or(codes::SERVICE_FAILED);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{service} failed"));
        let retryable = error.get("retryable").and_then(Value::as_bool).unwrap_or(true);
        let mut err = ServiceCallError::new(code, message, retryable);
        if error.is_object() {
            err = err.with_details(error);
        }
        return Err(err);
    }

    let data = match body.get_mut("data") {
        Some(data @ Value::Object(_)) => data.take(),
        _ => {
            return Err(ServiceCallError::new(
                codes::BAD_RESPONSE,
                "missing data object",
                true,
            ))
        }
    };

    let metrics = match body.get_mut("metrics") {
        None => Map::new(),
        Some(Value::Object(metrics)) => std::mem::take(metrics),
        Some(_) => {
            return Err(ServiceCallError::new(
                codes::BAD_RESPONSE,
                "metrics must be an object",
                true,
            ))
        }
    };

    Ok(ServiceOutput { data, metrics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn busy_statuses_map_to_resource_exhausted() {
        for status in [429, 503] {
            let err = classify_http_failure(
                status,
                Some(json!({"status": "FAILED", "error": {"code": "X", "message": "m", "retryable": false}})),
            );
            assert_eq!(err.code, codes::RESOURCE_EXHAUSTED);
            assert!(err.retryable);
        }
    }

    #[test]
    fn failure_body_drives_code_and_retryable() {
        let err = classify_http_failure(
            422,
            Some(json!({
                "status": "FAILED",
                "error": {"code": "PROMPT_REJECTED", "message": "unsafe prompt", "retryable": false}
            })),
        );
        assert_eq!(err.code, "PROMPT_REJECTED");
        assert_eq!(err.message, "unsafe prompt");
        assert!(!err.retryable);
        assert!(err.details.is_some());
    }

    #[test]
    fn plain_4xx_is_not_retryable() {
        let err = classify_http_failure(404, Some(json!({"detail": "not found"})));
        assert_eq!(err.code, codes::SERVICE_HTTP_ERROR);
        assert!(!err.retryable);
    }

    #[test]
    fn plain_5xx_is_retryable() {
        let err = classify_http_failure(500, None);
        assert_eq!(err.code, codes::SERVICE_HTTP_ERROR);
        assert!(err.retryable);
    }

    #[test]
    fn failure_body_without_retryable_defaults_from_status() {
        let body = json!({"status": "FAILED", "error": {"code": "E", "message": "m"}});
        assert!(classify_http_failure(500, Some(body.clone())).retryable);
        assert!(!classify_http_failure(400, Some(body)).retryable);
    }

    #[test]
    fn non_json_success_body_is_bad_response() {
        let err = parse_success("svc", None).unwrap_err();
        assert_eq!(err.code, codes::BAD_RESPONSE);
        assert!(err.retryable);
    }

    #[test]
    fn failed_success_body_uses_embedded_error() {
        let err = parse_success(
            "svc",
            Some(json!({
                "status": "FAILED",
                "error": {"code": "MODEL_OVERLOADED", "message": "try later", "retryable": true}
            })),
        )
        .unwrap_err();
        assert_eq!(err.code, "MODEL_OVERLOADED");
        assert!(err.retryable);
    }

    #[test]
    fn failed_success_body_without_error_defaults() {
        let err = parse_success("svc", Some(json!({"status": "FAILED"}))).unwrap_err();
        assert_eq!(err.code, codes::SERVICE_FAILED);
        assert_eq!(err.message, "svc failed");
        assert!(err.retryable);
    }

    #[test]
    fn missing_data_object_is_bad_response() {
        for body in [json!({"status": "SUCCESS"}), json!({"status": "SUCCESS", "data": 3})] {
            let err = parse_success("svc", Some(body)).unwrap_err();
            assert_eq!(err.code, codes::BAD_RESPONSE);
        }
    }

    #[test]
    fn metrics_must_be_object_when_present() {
        let err = parse_success(
            "svc",
            Some(json!({"status": "SUCCESS", "data": {}, "metrics": [1, 2]})),
        )
        .unwrap_err();
        assert_eq!(err.code, codes::BAD_RESPONSE);
    }

    #[test]
    fn success_defaults_metrics_to_empty() {
        let out = parse_success("svc", Some(json!({"status": "SUCCESS", "data": {"x": 1}})))
            .expect("success");
        assert_eq!(out.data["x"], 1);
        assert!(out.metrics.is_empty());
    }
}
