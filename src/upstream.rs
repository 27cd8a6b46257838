//! Outbound calls to the OpenAI-compatible provider.
//!
//! [`Transport`] is the seam to the network: send one request, get back a status
//! and a byte stream. [`UpstreamClient`] wraps a transport with the timeout and
//! retry policy and turns every failure into a [`NormalizedError`].
//!
//! Timeouts: `request_timeout` bounds each non-streaming attempt end to end, and
//! for streams the wait for response headers. Once a stream is handed out, each
//! gap between body chunks is bounded by `stream_idle_timeout`. Streams are never
//! retried once the body has been handed to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use thiserror::Error;

use crate::config::BridgeConfig;
use crate::error::{ErrorKind, NormalizedError};
use crate::translate::openai_types::{ChatCompletionRequest, ChatCompletionResponse, ChatErrorResponse};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

impl From<TransportError> for NormalizedError {
    fn from(e: TransportError) -> Self {
        NormalizedError::transport(e.to_string())
    }
}

pub struct UpstreamReply {
    pub status: u16,
    pub body: ByteStream,
}

/// Send one Chat Completions request. Implementations do no retrying.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        request: &ChatCompletionRequest,
    ) -> impl Future<Output = Result<UpstreamReply, TransportError>> + Send;

    /// Whether requests carry provider credentials.
    fn has_credentials(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    headers: HashMap<String, String>,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            client,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            headers,
        }
    }

    pub fn from_config(config: &BridgeConfig, client: reqwest::Client) -> crate::Result<Self> {
        let api_key = match config.resolve_api_key() {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, "Sending upstream requests without an API key");
                None
            }
        };
        Ok(Self::new(
            client,
            &config.effective_base_url()?,
            api_key,
            config.upstream.headers.clone(),
        ))
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        request: &ChatCompletionRequest,
    ) -> impl Future<Output = Result<UpstreamReply, TransportError>> + Send {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        async move {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response.bytes_stream().map_err(TransportError::from);
            Ok(UpstreamReply {
                status,
                body: Box::pin(body),
            })
        }
    }

    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: doubles from the base, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

pub struct UpstreamClient<T> {
    transport: T,
    retry: RetryPolicy,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl<T: Transport> UpstreamClient<T> {
    pub fn new(transport: T, retry: RetryPolicy, request_timeout: Duration, stream_idle_timeout: Duration) -> Self {
        Self {
            transport,
            retry,
            request_timeout,
            stream_idle_timeout,
        }
    }

    pub fn from_config(transport: T, config: &BridgeConfig) -> Self {
        Self::new(
            transport,
            config.retry_policy(),
            config.request_timeout(),
            config.stream_idle_timeout(),
        )
    }

    pub fn has_credentials(&self) -> bool {
        self.transport.has_credentials()
    }

    /// Non-streaming call. Retried as a whole on retryable failures.
    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, NormalizedError> {
        self.with_retry(|| async move {
            let attempt = async {
                let reply = self.transport.send(request).await?;
                let body = collect_body(reply.body).await?;
                if !is_success(reply.status) {
                    return Err(provider_error(reply.status, &body));
                }
                parse_completion(&body)
            };
            tokio::time::timeout(self.request_timeout, attempt)
                .await
                .unwrap_or_else(|_| Err(self.timeout_error()))
        })
        .await
    }

    /// Open a streaming call. Only the connection and status are retried; the
    /// returned body is handed out once and yields a timeout error if the
    /// provider goes quiet for longer than the idle timeout.
    pub async fn open_stream(&self, request: &ChatCompletionRequest) -> Result<ByteStream, NormalizedError> {
        let body = self
            .with_retry(|| async move {
                let reply = tokio::time::timeout(self.request_timeout, self.transport.send(request))
                    .await
                    .map_err(|_| self.timeout_error())??;
                if !is_success(reply.status) {
                    let body = tokio::time::timeout(self.request_timeout, collect_body(reply.body))
                        .await
                        .unwrap_or_else(|_| Ok(Bytes::new()))?;
                    return Err(provider_error(reply.status, &body));
                }
                Ok(reply.body)
            })
            .await?;

        let idle = self.stream_idle_timeout;
        let guarded = tokio_stream::StreamExt::timeout(body, idle).map(move |item| match item {
            Ok(chunk) => chunk,
            Err(_) => Err(TransportError::Timeout(format!(
                "no data from upstream for {}s",
                idle.as_secs()
            ))),
        });
        Ok(Box::pin(guarded))
    }

    async fn with_retry<F, Fut, R>(&self, mut call: F) -> Result<R, NormalizedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, NormalizedError>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(retries = attempt, "Upstream call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.retryable && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying upstream call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if err.retryable {
                        tracing::error!(attempts = attempt + 1, error = %err, "Upstream retries exhausted");
                    }
                    return Err(err.exhausted());
                }
            }
        }
    }

    fn timeout_error(&self) -> NormalizedError {
        NormalizedError::transport(format!(
            "upstream request timed out after {}s",
            self.request_timeout.as_secs()
        ))
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

async fn collect_body(mut body: ByteStream) -> Result<Bytes, TransportError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

fn parse_completion(body: &[u8]) -> Result<ChatCompletionResponse, NormalizedError> {
    // Some providers answer 200 with an error object
    if let Ok(err) = serde_json::from_slice::<ChatErrorResponse>(body) {
        let status = err
            .error
            .code
            .as_ref()
            .and_then(serde_json::Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .filter(|c| *c >= 400)
            .unwrap_or(502);
        return Err(NormalizedError::provider(status, with_hint(err.error.message)));
    }

    serde_json::from_slice(body).map_err(|e| {
        NormalizedError::new(
            ErrorKind::UpstreamProvider,
            format!(
                "Failed to parse provider response: {e}. Body: {}",
                truncate_chars(&String::from_utf8_lossy(body), 300)
            ),
        )
    })
}

/// Build the normalized error for a non-2xx provider answer.
pub fn provider_error(status: u16, body: &[u8]) -> NormalizedError {
    let message = match serde_json::from_slice::<ChatErrorResponse>(body) {
        Ok(err) if !err.error.message.is_empty() => err.error.message,
        _ => {
            let text = String::from_utf8_lossy(body);
            if text.trim().is_empty() {
                format!("Provider returned status {status}")
            } else {
                format!("Provider returned status {status}: {}", truncate_chars(text.trim(), 500))
            }
        }
    };
    tracing::warn!(status, %message, "Provider error");
    NormalizedError::provider(status, with_hint(message))
}

const PROVIDER_HINTS: &[(&[&str], &str)] = &[
    (
        &["unsupported_country_region_territory", "country, region, or territory not supported"],
        "the provider is not available in this region; try another base_url",
    ),
    (
        &["invalid_api_key", "incorrect api key", "unauthorized"],
        "check the API key in the variable named by upstream.api_key_env",
    ),
    (
        &["billing", "payment", "insufficient_quota"],
        "check the billing status of the provider account",
    ),
    (
        &["rate_limit", "rate limit", "quota"],
        "rate limit exceeded; wait and retry or raise the plan limits",
    ),
    (
        &["model_not_found", "model not found", "does not exist"],
        "check the configured big/middle/small/vision model names",
    ),
];

fn with_hint(message: String) -> String {
    let lowered = message.to_lowercase();
    match PROVIDER_HINTS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lowered.contains(n)))
    {
        Some((_, hint)) => format!("{message} (hint: {hint})"),
        None => message,
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
