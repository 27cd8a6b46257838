use crate::config::BridgeConfig;
use crate::error::NormalizedError;
use crate::translate::anthropic_types::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::translate::normalize::{normalize, NormalizeOptions};
use crate::translate::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatErrorResponse, ChatMessage,
};
use crate::translate::request::{canonical_to_openai, ConvertOptions};
use crate::translate::response::openai_to_anthropic;
use crate::translate::router::ModelRouter;
use crate::translate::streaming::StreamTranslator;
use crate::upstream::{ByteStream, Transport, UpstreamClient};

use eventsource_stream::Eventsource;
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;

/// Translated Anthropic SSE events, ready to be framed by the server.
pub type SseStream = Pin<Box<dyn Stream<Item = SseEvent> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    fn from_event(event: &StreamEvent) -> Option<Self> {
        match serde_json::to_string(event) {
            Ok(data) => Some(Self {
                event: event.event_name().to_string(),
                data,
            }),
            Err(e) => {
                tracing::error!(error = %e, event = event.event_name(), "Failed to serialize stream event");
                None
            }
        }
    }
}

/// Normalize, route and convert an inbound request. Fails before any network
/// call on content the upstream protocol cannot carry.
pub fn prepare_request(
    req: &MessagesRequest,
    config: &BridgeConfig,
    router: &ModelRouter,
) -> Result<ChatCompletionRequest, NormalizedError> {
    let mut canonical = normalize(req, &NormalizeOptions::from_config(&config.vision))?;
    router.apply(&mut canonical);
    canonical_to_openai(&canonical, &config.limits, &ConvertOptions::from_config(config))
}

/// Forward a non-streaming request and translate the reply.
pub async fn proxy_non_streaming<T: Transport>(
    req: &MessagesRequest,
    config: &BridgeConfig,
    router: &ModelRouter,
    upstream: &UpstreamClient<T>,
) -> Result<MessagesResponse, NormalizedError> {
    let openai_req = prepare_request(req, config, router)?;

    tracing::info!(
        requested = %req.model,
        model = %openai_req.model,
        messages = openai_req.messages.len(),
        max_tokens = ?openai_req.max_tokens,
        "Forwarding request"
    );

    let resp = upstream.complete(&openai_req).await?;
    let anthropic_resp = openai_to_anthropic(&resp, &openai_req.model);

    tracing::info!(
        input_tokens = anthropic_resp.usage.input_tokens,
        output_tokens = anthropic_resp.usage.output_tokens,
        stop_reason = ?anthropic_resp.stop_reason,
        "Completed"
    );

    Ok(anthropic_resp)
}

/// Forward a streaming request. Errors before the first upstream byte come
/// back as `Err`; anything later is delivered in-band as an `error` event.
pub async fn proxy_streaming<T: Transport>(
    req: &MessagesRequest,
    config: &BridgeConfig,
    router: &ModelRouter,
    upstream: &UpstreamClient<T>,
) -> Result<SseStream, NormalizedError> {
    let openai_req = prepare_request(req, config, router)?;

    tracing::info!(
        requested = %req.model,
        model = %openai_req.model,
        messages = openai_req.messages.len(),
        "Forwarding streaming request"
    );

    let body = upstream.open_stream(&openai_req).await?;
    Ok(Box::pin(translate_event_stream(body, openai_req.model)))
}

/// Minimal completion against the small tier, used to check connectivity and
/// credentials without a client request.
pub fn connection_check_request(config: &BridgeConfig) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: config.models.small.clone(),
        messages: vec![ChatMessage::text("user", "Hello")],
        max_tokens: Some(5),
        temperature: None,
        top_p: None,
        stream: false,
        stream_options: None,
        tools: None,
        tool_choice: None,
        stop: None,
        user: None,
    }
}

pub async fn check_connection<T: Transport>(
    config: &BridgeConfig,
    upstream: &UpstreamClient<T>,
) -> Result<ChatCompletionResponse, NormalizedError> {
    let req = connection_check_request(config);
    tracing::info!(model = %req.model, "Testing upstream connection");
    upstream.complete(&req).await
}

enum StreamPayload {
    Chunk(ChatCompletionChunk),
    Error(NormalizedError),
    Skip,
}

fn parse_payload(data: &str) -> StreamPayload {
    if let Ok(err) = serde_json::from_str::<ChatErrorResponse>(data) {
        return StreamPayload::Error(NormalizedError::stream(format!(
            "upstream error mid-stream: {}",
            err.error.message
        )));
    }
    match serde_json::from_str(data) {
        Ok(chunk) => StreamPayload::Chunk(chunk),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable chunk");
            StreamPayload::Skip
        }
    }
}

/// Logs when the consumer goes away before the stream reached a terminal
/// event. Dropping the stream drops the upstream body with it.
struct DisconnectGuard {
    model: String,
    finished: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::info!(model = %self.model, "Client disconnected mid-stream, upstream released");
        }
    }
}

/// Parse the upstream SSE body and re-emit it as Anthropic events.
pub fn translate_event_stream(
    body: ByteStream,
    model: String,
) -> impl Stream<Item = SseEvent> + Send + 'static {
    async_stream::stream! {
        let mut guard = DisconnectGuard { model: model.clone(), finished: false };
        let mut translator = StreamTranslator::new(&model);
        let mut upstream = body.eventsource();
        let mut failure = None;

        while let Some(item) = upstream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    failure = Some(NormalizedError::stream(format!("upstream stream failed: {e}")));
                    break;
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                break;
            }

            match parse_payload(data) {
                StreamPayload::Chunk(chunk) => {
                    for out in translator.process_chunk(&chunk) {
                        if let Some(sse) = SseEvent::from_event(&out) {
                            yield sse;
                        }
                    }
                }
                StreamPayload::Error(err) => {
                    failure = Some(err);
                    break;
                }
                StreamPayload::Skip => {}
            }
        }

        let closing = match failure {
            Some(err) => {
                tracing::warn!(model = %model, error = %err, "Upstream stream aborted");
                translator.fail(&err)
            }
            None => {
                tracing::info!(model = %model, "Stream completed");
                translator.finish()
            }
        };
        for out in closing {
            if let Some(sse) = SseEvent::from_event(&out) {
                yield sse;
            }
        }
        guard.finished = true;
    }
}
