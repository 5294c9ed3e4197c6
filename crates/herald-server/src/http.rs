//! HTTP adapters for the generator and sender collaborators.
//!
//! Both POST JSON to a configured endpoint. Transport failures, timeouts,
//! `429` and `5xx` are retryable; any other non-2xx status or an unexpected
//! response body is fatal.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_core::{Artifact, CollaboratorError, Delivery, Generator, Sender};

const USER_AGENT: &str = "herald/0.1 (job-orchestrator)";
const MAX_ERROR_BODY: usize = 200;

fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(USER_AGENT)
        .build()
}

fn parse_url(url: &str) -> anyhow::Result<Url> {
    Url::parse(url).map_err(|e| anyhow::anyhow!("invalid collaborator URL '{url}': {e}"))
}

fn transport_error(err: &reqwest::Error) -> CollaboratorError {
    if err.is_decode() {
        CollaboratorError::fatal(format!("malformed response body: {err}"))
    } else if err.is_timeout() {
        CollaboratorError::retryable(format!("request timed out: {err}"))
    } else {
        CollaboratorError::retryable(format!("connection error: {err}"))
    }
}

fn status_error(status: StatusCode, body: &str) -> CollaboratorError {
    let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = format!("HTTP {status}: {snippet}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        CollaboratorError::retryable(message)
    } else {
        CollaboratorError::fatal(message)
    }
}

/// Sends `body` and decodes a 2xx JSON response into `T`.
async fn post_json<B, T>(client: &Client, url: &Url, body: &B) -> Result<T, CollaboratorError>
where
    B: Serialize + ?Sized,
    T: for<'de> Deserialize<'de>,
{
    let response = client
        .post(url.clone())
        .json(body)
        .send()
        .await
        .map_err(|e| transport_error(&e))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(status_error(status, &text));
    }

    response.json::<T>().await.map_err(|e| transport_error(&e))
}

/// Calls an external generation service.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: Client,
    url: Url,
}

impl HttpGenerator {
    /// # Errors
    ///
    /// Returns an error if `url` does not parse or the client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: parse_url(url)?,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, spec: &serde_json::Value) -> Result<Artifact, CollaboratorError> {
        let artifact: Artifact = post_json(&self.client, &self.url, spec).await?;
        if artifact.artifact_ref.trim().is_empty() {
            return Err(CollaboratorError::fatal(
                "generator returned an empty artifact_ref",
            ));
        }
        Ok(artifact)
    }
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    artifact_ref: &'a str,
    recipient_id: Uuid,
    delivery_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    receipt_id: String,
}

/// Calls an external send transport.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: Client,
    url: Url,
}

impl HttpSender {
    /// # Errors
    ///
    /// Returns an error if `url` does not parse or the client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: parse_url(url)?,
        })
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, delivery: &Delivery) -> Result<String, CollaboratorError> {
        let request = SendRequest {
            artifact_ref: &delivery.artifact_ref,
            recipient_id: delivery.recipient_id,
            delivery_id: delivery.id,
        };
        let response: SendResponse = post_json(&self.client, &self.url, &request).await?;
        Ok(response.receipt_id)
    }
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
