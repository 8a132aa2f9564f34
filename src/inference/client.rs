//! OpenAI-compatible inference client.
//!
//! [`ModelClient`] is the seam the conversation loop and the maintenance
//! scheduler talk to; [`InferenceClient`] implements it over HTTP against any
//! `/chat/completions` endpoint.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Client as HttpClient;

use super::errors::InferenceError;
use super::streaming::{parse_non_streaming_response, parse_sse_stream};
use super::types::{ChatCompletionRequest, ModelRequest};
use crate::config::EndpointConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for non-streaming calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Total request timeout for streaming calls.
///
/// Large prompts can take a long time before the first token arrives.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ─── ModelClient ─────────────────────────────────────────────────────────────

/// Incremental text output of a streaming model call.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

/// A chat-completion backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Open a streaming call. Errors here mean no token was produced.
    async fn chat_completion_stream(&self, request: ModelRequest)
        -> Result<TokenStream, InferenceError>;

    /// Run a call to completion and return the full reply text.
    async fn chat_completion(&self, request: ModelRequest) -> Result<String, InferenceError>;
}

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// HTTP client for an OpenAI-compatible endpoint.
pub struct InferenceClient {
    /// HTTP client for non-streaming requests.
    http: HttpClient,
    /// HTTP client for streaming requests (longer timeout).
    http_stream: HttpClient,
    base_url: String,
}

impl InferenceClient {
    /// Build a client for the configured endpoint.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(endpoint: &EndpointConfig) -> Result<Self, InferenceError> {
        let headers = default_headers(endpoint)?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers.clone())
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: endpoint.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: endpoint.base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            http_stream,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Check if the endpoint is reachable.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        match self.http.get(&url).timeout(CONNECT_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ModelClient for InferenceClient {
    async fn chat_completion_stream(
        &self,
        request: ModelRequest,
    ) -> Result<TokenStream, InferenceError> {
        let url = self.completions_url();
        let body = ChatCompletionRequest::from_model_request(request, true);

        // Log the request metadata, not the body.
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            stream = body.stream,
            "=== LLM REQUEST ==="
        );

        let response = self
            .http_stream
            .post(&url)
            .json(&body)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| map_send_error(&url, e, STREAM_REQUEST_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(Box::pin(parse_sse_stream(response.bytes_stream())))
    }

    async fn chat_completion(&self, request: ModelRequest) -> Result<String, InferenceError> {
        let url = self.completions_url();
        let body = ChatCompletionRequest::from_model_request(request, false);

        tracing::debug!(url = %url, model = %body.model, "non-streaming completion");

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(&url, e, REQUEST_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response.text().await.map_err(|e| InferenceError::StreamError {
            reason: format!("failed to read response body: {e}"),
        })?;

        parse_non_streaming_response(&body_text)
    }
}

fn map_send_error(url: &str, e: reqwest::Error, timeout: Duration) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout {
            duration_secs: timeout.as_secs(),
        }
    } else {
        InferenceError::ConnectionFailed {
            endpoint: url.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Auth and extra headers sent with every request.
fn default_headers(endpoint: &EndpointConfig) -> Result<HeaderMap, InferenceError> {
    let mut headers = HeaderMap::new();

    if let Some(key) = endpoint.api_key.as_deref().filter(|k| !k.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| {
            InferenceError::ConfigError {
                reason: format!("invalid api_key: {e}"),
            }
        })?;
        headers.insert(AUTHORIZATION, value);
    }

    for (name, value) in &endpoint.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            InferenceError::ConfigError {
                reason: format!("invalid header name '{name}': {e}"),
            }
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| InferenceError::ConfigError {
            reason: format!("invalid value for header '{name}': {e}"),
        })?;
        headers.insert(name, value);
    }

    Ok(headers)
}

// ─── Static Response Fallback ────────────────────────────────────────────────

/// Text shown to the user when the model cannot be reached at all.
pub fn static_fallback_response(err: &InferenceError) -> String {
    if err.is_unreachable() {
        format!(
            "The model server is not reachable ({err}). \
             Check that it is running and that `endpoint.base_url` is correct."
        )
    } else {
        format!("The model server returned an error: {err}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
