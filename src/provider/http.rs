//! HTTP provider implementation.
//!
//! Sends every request as JSON to a provider service:
//! `POST` creates, `PUT` updates and `DELETE` destroys
//! `{endpoint}/resources/{kind}/{name}`. Create and update responses carry
//! `{"outputs": {...}}`. The client does not retry; retries belong to the
//! execution engine.

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{Result, TerraceError};
use crate::state::Outputs;

use super::{Operation, Provider, ProviderFailure, ProviderRequest};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retry delay assumed when a 429 carries no usable `retry-after`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Provider backed by an HTTP service.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Optional bearer token.
    token: Option<String>,
}

/// Response body of create and update calls.
#[derive(Debug, Deserialize)]
struct ApplyResponse {
    #[serde(default)]
    outputs: Outputs,
}

impl HttpProvider {
    /// Creates a provider for `endpoint` with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::with_timeout(endpoint, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a provider with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TerraceError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Sets the bearer token sent with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, request: &ProviderRequest) -> String {
        format!(
            "{}/resources/{}/{}",
            self.endpoint, request.resource.kind, request.resource.name
        )
    }

    const fn method(operation: Operation) -> Method {
        match operation {
            Operation::Create => Method::POST,
            Operation::Update => Method::PUT,
            Operation::Delete => Method::DELETE,
        }
    }

    fn retry_after(response: &reqwest::Response) -> Duration {
        let secs = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&s| s > 0)
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        Duration::from_secs(secs)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn apply(&self, request: &ProviderRequest) -> std::result::Result<Outputs, ProviderFailure> {
        let url = self.url(request);
        trace!("{} {url}", request.operation);

        let mut builder = self
            .client
            .request(Self::method(request.operation), &url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderFailure::new(format!("Request to {url} failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let delay = Self::retry_after(&response);
            return Err(ProviderFailure::with_status(status.as_u16(), "rate limited").retry_after(delay));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderFailure::with_status(status.as_u16(), body));
        }

        if request.operation == Operation::Delete {
            debug!("Deleted {}", request.resource);
            return Ok(Outputs::new());
        }

        let body: ApplyResponse = response.json().await.map_err(|e| {
            ProviderFailure::with_status(status.as_u16(), format!("Invalid response body: {e}"))
        })?;

        debug!(
            "{} {} returned {} outputs",
            request.operation,
            request.resource,
            body.outputs.len()
        );
        Ok(body.outputs)
    }

    fn name(&self) -> &str {
        "http"
    }
}
