//! User-priority lookup against the external priority API.

use anyhow::Context;
use conveyor_core::job::Priority;
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone)]
pub struct PriorityClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PriorityResponse {
    priority: String,
}

impl PriorityClient {
    pub fn new(
        base_url: String,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .context("build priority http client")?;
        Ok(Self { http, base_url })
    }

    /// Fetch the user's priority class. Any failure (transport, non-2xx,
    /// invalid value) defaults to `medium` so job creation never blocks on
    /// the lookup service.
    pub async fn user_priority(&self, user_id: &str) -> Priority {
        match self.fetch(user_id).await {
            Ok(priority) => priority,
            Err(err) => {
                tracing::warn!(
                    event = "conveyor.priority.lookup_failed",
                    user_id = %user_id,
                    error = %err,
                    "defaulting to medium priority"
                );
                Priority::Medium
            }
        }
    }

    async fn fetch(&self, user_id: &str) -> anyhow::Result<Priority> {
        let url = format!(
            "{}/users/{user_id}/priority",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("GET user priority")?
            .error_for_status()
            .context("priority lookup status")?;

        let body: PriorityResponse = response.json().await.context("decode priority response")?;
        Priority::parse(&body.priority.to_lowercase())
            .with_context(|| format!("invalid priority value {:?}", body.priority))
    }
}
