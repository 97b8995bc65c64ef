//! HTTP clients for the capabilities.
//!
//! Each service is a JSON-over-POST endpoint. What matters to the job engine
//! is the failure mapping:
//!
//! | outcome | `CapabilityError` |
//! |---|---|
//! | connect/read error, request timeout | `Transient` |
//! | 408, 5xx | `Transient` |
//! | 429 | `RateLimited` |
//! | other 4xx | `Permanent` |
//! | 2xx with an undecodable body | `Malformed` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use troubadour_core::UserId;

use crate::capability::{AudioAnalyzer, ComparisonEnricher, CritiqueGenerator, NotificationSink};
use crate::error::{CapabilityError, NotifyError};
use crate::model::{AlbumRequest, ComparisonRequest, Critique, CritiqueRequest, FeatureSet};

/// Longest response body excerpt kept in an error message.
const ERROR_BODY_EXCERPT: usize = 300;

/// A single JSON endpoint with shared connection pool.
#[derive(Debug, Clone)]
pub struct JsonEndpoint {
    client: Client,
    base_url: String,
}

impl JsonEndpoint {
    /// `request_timeout` is a transport-level ceiling; the job engine applies
    /// its own per-stage budget on top.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, CapabilityError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CapabilityError::permanent(format!("failed to build http client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, CapabilityError>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(url = %url, "calling capability");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| CapabilityError::transient(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CapabilityError::transient(format!("reading body from {url}: {e}")))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| CapabilityError::malformed(format!("undecodable response from {url}: {e}")))
    }
}

/// Map a non-success HTTP status onto the retry taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> CapabilityError {
    let excerpt: String = body.chars().take(ERROR_BODY_EXCERPT).collect();
    let msg = format!("{status}: {excerpt}");

    if status == StatusCode::TOO_MANY_REQUESTS {
        CapabilityError::RateLimited(msg)
    } else if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        CapabilityError::Transient(msg)
    } else {
        CapabilityError::Permanent(msg)
    }
}

/// Audio analysis over HTTP: `POST {base}` with `{media_ref, focus}`.
#[derive(Debug, Clone)]
pub struct HttpAudioAnalyzer {
    endpoint: JsonEndpoint,
}

impl HttpAudioAnalyzer {
    pub fn new(endpoint: JsonEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl AudioAnalyzer for HttpAudioAnalyzer {
    async fn analyze(
        &self,
        media_ref: &str,
        focus: Option<&str>,
    ) -> Result<FeatureSet, CapabilityError> {
        self.endpoint
            .post("", &json!({ "media_ref": media_ref, "focus": focus }))
            .await
    }
}

/// Critique generation over HTTP: `/critique`, `/album`, `/compare`.
#[derive(Debug, Clone)]
pub struct HttpCritiqueGenerator {
    endpoint: JsonEndpoint,
}

impl HttpCritiqueGenerator {
    pub fn new(endpoint: JsonEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl CritiqueGenerator for HttpCritiqueGenerator {
    async fn critique(&self, request: &CritiqueRequest) -> Result<Critique, CapabilityError> {
        let critique: Critique = self.endpoint.post("critique", request).await?;
        require_text(critique)
    }

    async fn synthesize_album(&self, request: &AlbumRequest) -> Result<Critique, CapabilityError> {
        let critique: Critique = self.endpoint.post("album", request).await?;
        require_text(critique)
    }

    async fn compare_versions(
        &self,
        request: &ComparisonRequest,
    ) -> Result<Critique, CapabilityError> {
        let critique: Critique = self.endpoint.post("compare", request).await?;
        require_text(critique)
    }
}

fn require_text(critique: Critique) -> Result<Critique, CapabilityError> {
    if critique.text.trim().is_empty() {
        return Err(CapabilityError::malformed("critique response had an empty body"));
    }
    Ok(critique)
}

#[derive(Debug, serde::Deserialize)]
struct EnrichmentResponse {
    text: String,
}

/// Side-by-side enrichment over HTTP: `POST {base}` with `{media_a, media_b}`.
#[derive(Debug, Clone)]
pub struct HttpComparisonEnricher {
    endpoint: JsonEndpoint,
}

impl HttpComparisonEnricher {
    pub fn new(endpoint: JsonEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl ComparisonEnricher for HttpComparisonEnricher {
    async fn compare(&self, media_a: &str, media_b: &str) -> Result<String, CapabilityError> {
        let response: EnrichmentResponse = self
            .endpoint
            .post("", &json!({ "media_a": media_a, "media_b": media_b }))
            .await?;
        Ok(response.text)
    }
}

/// Notification delivery through a webhook (`{owner_id, title, content}`).
#[derive(Debug, Clone)]
pub struct WebhookNotificationSink {
    client: Client,
    url: String,
}

impl WebhookNotificationSink {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn notify(&self, owner: UserId, title: &str, content: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "owner_id": owner.to_string(),
                "title": title,
                "content": content,
            }))
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Delivery(format!(
                "webhook answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Sink that only logs; used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, owner: UserId, title: &str, content: &str) -> Result<(), NotifyError> {
        tracing::info!(owner = %owner, title, content, "notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            CapabilityError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "upstream"),
            CapabilityError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, ""),
            CapabilityError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad media"),
            CapabilityError::Permanent(_)
        ));
    }

    #[test]
    fn error_body_is_truncated() {
        let body = "x".repeat(5_000);
        let CapabilityError::Permanent(msg) = classify_status(StatusCode::BAD_REQUEST, &body) else {
            panic!("expected permanent");
        };
        assert!(msg.len() < 400);
    }

    #[test]
    fn urls_join_without_double_slashes() {
        let endpoint = JsonEndpoint::with_client(Client::new(), "http://critic.local/v1/");
        assert_eq!(endpoint.url("critique"), "http://critic.local/v1/critique");
        assert_eq!(endpoint.url(""), "http://critic.local/v1");
    }

    #[test]
    fn empty_critique_is_malformed() {
        let err = require_text(Critique::default()).unwrap_err();
        assert!(err.is_retryable());
    }
}
