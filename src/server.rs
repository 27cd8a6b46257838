use crate::config::BridgeConfig;
use crate::error::NormalizedError;
use crate::logging::{batch_events, SharedEventLog};
use crate::proxy;
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest};
use crate::translate::context::count_request_tokens;
use crate::translate::router::ModelRouter;
use crate::upstream::{Transport, UpstreamClient};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct AppState<T> {
    pub config: Arc<BridgeConfig>,
    pub router: ModelRouter,
    pub upstream: UpstreamClient<T>,
    pub event_log: SharedEventLog,
}

impl<T: Transport> AppState<T> {
    pub fn new(config: BridgeConfig, transport: T, event_log: SharedEventLog) -> Self {
        Self {
            router: ModelRouter::new(&config.models),
            upstream: UpstreamClient::from_config(transport, &config),
            config: Arc::new(config),
            event_log,
        }
    }
}

pub fn build_router<T: Transport>(state: Arc<AppState<T>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages::<T>))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/api/event_logging/batch", post(handle_event_batch::<T>))
        .route("/health", get(handle_health::<T>))
        .route("/test-connection", get(handle_test_connection::<T>))
        .route("/", get(handle_root::<T>))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: &NormalizedError) -> Response {
    let status = StatusCode::from_u16(err.client_status()).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(err.to_error_response())).into_response()
}

fn parse_request(body: &[u8]) -> Result<MessagesRequest, Response> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::warn!(error = %e, "Failed to parse request");
        let err = ErrorResponse::invalid_request(format!("Invalid request body: {e}"));
        (StatusCode::BAD_REQUEST, Json(err)).into_response()
    })
}

async fn handle_messages<T: Transport>(State(state): State<Arc<AppState<T>>>, body: Bytes) -> Response {
    let req = match parse_request(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let is_streaming = req.stream.unwrap_or(false);

    tracing::debug!(
        model = %req.model,
        streaming = is_streaming,
        messages = req.messages.len(),
        "Request"
    );

    if is_streaming {
        handle_streaming(&state, &req).await
    } else {
        handle_non_streaming(&state, &req).await
    }
}

async fn handle_non_streaming<T: Transport>(state: &AppState<T>, req: &MessagesRequest) -> Response {
    match proxy::proxy_non_streaming(req, &state.config, &state.router, &state.upstream).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "Request failed");
            error_response(&err)
        }
    }
}

async fn handle_streaming<T: Transport>(state: &AppState<T>, req: &MessagesRequest) -> Response {
    let sse_stream =
        match proxy::proxy_streaming(req, &state.config, &state.router, &state.upstream).await {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(error = %err, "Streaming setup failed");
                return error_response(&err);
            }
        };

    let event_stream = sse_stream
        .map(|sse| Ok::<_, Infallible>(Event::default().event(sse.event).data(sse.data)));

    Sse::new(event_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_count_tokens(body: Bytes) -> Response {
    match parse_request(&body) {
        Ok(req) => Json(serde_json::json!({ "input_tokens": count_request_tokens(&req) })).into_response(),
        Err(resp) => resp,
    }
}

async fn handle_event_batch<T: Transport>(State(state): State<Arc<AppState<T>>>, body: Bytes) -> Response {
    let events = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(value) => batch_events(value),
        Err(e) => {
            tracing::debug!(error = %e, "Event batch was not JSON");
            Vec::new()
        }
    };

    match state.event_log.append_blocking(events).await {
        Ok(logged) => {
            tracing::debug!(logged, "Stored client events");
            Json(serde_json::json!({ "status": "ok", "logged": logged })).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to write event log");
            let err = ErrorResponse::api_error(format!("Failed to write event log: {e}"));
            (StatusCode::INTERNAL_SERVER_ERROR, Json(err)).into_response()
        }
    }
}

async fn handle_health<T: Transport>(State(state): State<Arc<AppState<T>>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "api_key_configured": state.upstream.has_credentials(),
    }))
}

async fn handle_test_connection<T: Transport>(State(state): State<Arc<AppState<T>>>) -> Response {
    let model = &state.config.models.small;
    match proxy::check_connection(&state.config, &state.upstream).await {
        Ok(resp) => {
            let response_id = if resp.id.is_empty() { "unknown" } else { resp.id.as_str() };
            Json(serde_json::json!({
                "status": "success",
                "message": "Upstream provider reachable",
                "model_used": model,
                "response_id": response_id,
                "timestamp": Utc::now().to_rfc3339(),
            }))
            .into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "Upstream connection test failed");
            let body = serde_json::json!({
                "status": "failed",
                "error_type": err.anthropic_error_type(),
                "message": err.message,
                "model_used": model,
                "timestamp": Utc::now().to_rfc3339(),
                "suggestions": [
                    "Check that the API key environment variable is set and valid",
                    "Verify the key has access to the configured small model",
                    "Check whether the provider's rate limits or quota were reached",
                ],
            });
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

async fn handle_root<T: Transport>(State(state): State<Arc<AppState<T>>>) -> Json<serde_json::Value> {
    let config = &state.config;
    Json(serde_json::json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "upstream": config.effective_base_url().ok(),
        "models": {
            "big": config.models.big,
            "middle": config.models.middle(),
            "small": config.models.small,
            "vision": config.models.vision,
        },
        "limits": {
            "max_tokens": config.limits.max_tokens,
            "min_tokens": config.limits.min_tokens,
            "context_window": config.limits.context.default,
        },
        "strip_image_context": config.vision.strip_context,
        "tools_disabled": config.disable_tools,
    }))
}
