use claude_bridge::config::{BridgeConfig, EventLogConfig, ModelTiers, UpstreamConfig};
use claude_bridge::proxy::{self, translate_event_stream};
use claude_bridge::translate::anthropic_types::*;
use claude_bridge::translate::router::ModelRouter;
use claude_bridge::upstream::ByteStream;
use claude_bridge::{build_router, AppState, HttpTransport, SharedEventLog, UpstreamClient};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const API_KEY: &str = "test-key";

fn bridge_config(upstream: &MockServer, dir: &TempDir) -> BridgeConfig {
    BridgeConfig {
        upstream: UpstreamConfig {
            base_url: Some(upstream.uri()),
            max_retries: 2,
            retry_backoff_ms: 10,
            retry_backoff_cap_ms: 50,
            timeout_secs: 5,
            ..UpstreamConfig::default()
        },
        models: ModelTiers {
            big: "big-model".to_string(),
            middle: Some("middle-model".to_string()),
            small: "small-model".to_string(),
            vision: "vision-model".to_string(),
        },
        event_log: EventLogConfig {
            path: dir.path().join("events.log"),
            max_size_mb: 1,
        },
        ..BridgeConfig::default()
    }
}

fn transport(upstream: &MockServer) -> HttpTransport {
    HttpTransport::new(
        reqwest::Client::new(),
        &upstream.uri(),
        Some(API_KEY.to_string()),
        HashMap::new(),
    )
}

async fn spawn_bridge(config: BridgeConfig, upstream: &MockServer) -> SocketAddr {
    let event_log = SharedEventLog::open(&config.event_log).unwrap();
    let state = Arc::new(AppState::new(config, transport(upstream), event_log));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn completion(content: &str) -> Value {
    json!({
        "id": "chatcmpl-int1",
        "object": "chat.completion",
        "model": "small-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 11, "completion_tokens": 4, "total_tokens": 15}
    })
}

fn simple_request(model: &str, prompt: &str) -> Value {
    json!({
        "model": model,
        "max_tokens": 256,
        "system": "You are a helpful assistant. Respond very briefly.",
        "messages": [{"role": "user", "content": prompt}]
    })
}

fn sse_body(chunks: &[Value]) -> String {
    let mut body: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

fn event_names(sse: &str) -> Vec<String> {
    sse.lines()
        .filter_map(|l| l.strip_prefix("event: ").or_else(|| l.strip_prefix("event:")))
        .map(|s| s.trim().to_string())
        .collect()
}

// ────────────────────────────────────────────────────────────────
// Pipeline tests (upstream mocked, no server)
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_non_streaming_pipeline_routes_and_translates() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({"model": "small-model", "max_tokens": 256, "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("pong")))
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = bridge_config(&upstream, &dir);
    let router = ModelRouter::new(&config.models);
    let client = UpstreamClient::from_config(transport(&upstream), &config);
    let req: MessagesRequest =
        serde_json::from_value(simple_request("claude-3-5-haiku-20241022", "ping")).unwrap();

    let resp = proxy::proxy_non_streaming(&req, &config, &router, &client)
        .await
        .unwrap();

    assert_eq!(resp.id, "msg_int1");
    assert_eq!(resp.model, "small-model");
    assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
    assert_eq!(
        resp.content,
        vec![ResponseContentBlock::Text {
            text: "pong".to_string()
        }]
    );
    assert_eq!(resp.usage.input_tokens, 11);
}

#[tokio::test]
async fn test_retry_budget_hides_transient_503s() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("finally")))
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = bridge_config(&upstream, &dir);
    let router = ModelRouter::new(&config.models);
    let client = UpstreamClient::from_config(transport(&upstream), &config);
    let req: MessagesRequest = serde_json::from_value(simple_request("claude-sonnet-4", "hi")).unwrap();

    let resp = proxy::proxy_non_streaming(&req, &config, &router, &client)
        .await
        .unwrap();
    assert_eq!(
        resp.content,
        vec![ResponseContentBlock::Text {
            text: "finally".to_string()
        }]
    );
}

#[tokio::test]
async fn test_streaming_pipeline_with_tool_call() {
    let upstream = MockServer::start().await;
    let body = sse_body(&[
        json!({"id": "chatcmpl-s", "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Checking"}}]}),
        json!({"id": "chatcmpl-s", "choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": "call_w", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":"}}
        ]}}]}),
        json!({"id": "chatcmpl-s", "choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "\"London\"}"}}
        ]}}]}),
        json!({"id": "chatcmpl-s", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        json!({"id": "chatcmpl-s", "choices": [], "usage": {"prompt_tokens": 20, "completion_tokens": 9, "total_tokens": 29}}),
    ]);
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"stream": true, "stream_options": {"include_usage": true}})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = bridge_config(&upstream, &dir);
    let router = ModelRouter::new(&config.models);
    let client = UpstreamClient::from_config(transport(&upstream), &config);
    let mut req: MessagesRequest =
        serde_json::from_value(simple_request("claude-opus-4", "weather in London?")).unwrap();
    req.stream = Some(true);

    let events: Vec<_> = proxy::proxy_streaming(&req, &config, &router, &client)
        .await
        .unwrap()
        .collect()
        .await;

    let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let start: Value = serde_json::from_str(&events[0].data).unwrap();
    assert_eq!(start["message"]["model"], "big-model");

    let tool_stop: Value = serde_json::from_str(&events[7].data).unwrap();
    assert_eq!(tool_stop["index"], 1);
    assert_eq!(tool_stop["input"], json!({"city": "London"}));

    let delta: Value = serde_json::from_str(&events[8].data).unwrap();
    assert_eq!(delta["delta"]["stop_reason"], "tool_use");
    assert_eq!(delta["usage"]["input_tokens"], 20);
    assert_eq!(delta["usage"]["output_tokens"], 9);
}

#[test]
fn test_event_stream_translation_is_runtime_agnostic() {
    let parts: Vec<Result<bytes::Bytes, claude_bridge::upstream::TransportError>> = vec![
        Ok(bytes::Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"},\"finish_reason\":\"stop\"}]}\n\n",
        )),
        Ok(bytes::Bytes::from_static(b"data: [DONE]\n\n")),
    ];
    let body: ByteStream = Box::pin(futures::stream::iter(parts));

    let events: Vec<_> = tokio_test::block_on(translate_event_stream(body, "m".to_string()).collect());
    assert_eq!(events.first().map(|e| e.event.as_str()), Some("message_start"));
    assert_eq!(events.last().map(|e| e.event.as_str()), Some("message_stop"));
}

// ────────────────────────────────────────────────────────────────
// Server roundtrips
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_server_roundtrip() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("pong")))
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_bridge(bridge_config(&upstream, &dir), &upstream).await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    let health: Value = health.json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["api_key_configured"], true);

    let info: Value = client
        .get(format!("http://{addr}/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["models"]["vision"], "vision-model");

    let resp = client
        .post(format!("http://{addr}/v1/messages"))
        .json(&simple_request("claude-3-5-haiku-20241022", "Say 'pong'"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["text"], "pong");
    assert_eq!(body["usage"]["output_tokens"], 4);
}

#[tokio::test]
async fn test_server_streams_sse() {
    let upstream = MockServer::start().await;
    let body = sse_body(&[
        json!({"choices": [{"index": 0, "delta": {"content": "Hel"}}]}),
        json!({"choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]}),
    ]);
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_bridge(bridge_config(&upstream, &dir), &upstream).await;

    let mut req = simple_request("claude-sonnet-4", "hello");
    req["stream"] = json!(true);
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&req)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream")));

    let text = resp.text().await.unwrap();
    assert_eq!(
        event_names(&text),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
}

#[tokio::test]
async fn test_provider_auth_error_is_mapped_and_not_retried() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {"message": "Incorrect API key provided", "type": "invalid_request_error", "code": "invalid_api_key"}
        })))
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_bridge(bridge_config(&upstream, &dir), &upstream).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&simple_request("claude-sonnet-4", "hi"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "authentication_error");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Incorrect API key"));
}

#[tokio::test]
async fn test_exhausted_retries_surface_one_error() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_bridge(bridge_config(&upstream, &dir), &upstream).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&simple_request("claude-sonnet-4", "hi"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "overloaded_error");
}

#[tokio::test]
async fn test_upstream_timeout_becomes_gateway_error() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("too late"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = bridge_config(&upstream, &dir);
    config.upstream.timeout_secs = 1;
    config.upstream.max_retries = 0;
    let addr = spawn_bridge(config, &upstream).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&simple_request("claude-sonnet-4", "hi"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "api_error");
    assert!(body["error"]["message"].as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_invalid_image_rejected_without_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("unused")))
        .expect(0)
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_bridge(bridge_config(&upstream, &dir), &upstream).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .json(&json!({
            "model": "claude-sonnet-4",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "not base64!"}}
            ]}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let upstream = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_bridge(bridge_config(&upstream, &dir), &upstream).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_count_tokens() {
    let upstream = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_bridge(bridge_config(&upstream, &dir), &upstream).await;

    let body: Value = reqwest::Client::new()
        .post(format!("http://{addr}/v1/messages/count_tokens"))
        .json(&json!({
            "model": "claude-sonnet-4",
            "system": "a".repeat(40),
            "messages": [{"role": "user", "content": "b".repeat(40)}]
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["input_tokens"], 20);
}

#[tokio::test]
async fn test_event_logging_batch() {
    let upstream = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = bridge_config(&upstream, &dir);
    let log_path = config.event_log.path.clone();
    let addr = spawn_bridge(config, &upstream).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/event_logging/batch");

    let resp: Value = client
        .post(&url)
        .json(&json!([{"event": "a"}, {"event": "b"}]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["logged"], 2);

    let resp: Value = client.post(&url).json(&json!("just text")).send().await.unwrap().json().await.unwrap();
    assert_eq!(resp["logged"], 1);

    let resp = client.post(&url).body("garbage").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp: Value = resp.json().await.unwrap();
    assert_eq!(resp["logged"], 0);

    let lines: Vec<Value> = std::fs::read_to_string(&log_path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2]["event"], json!({"raw_data": "just text"}));
    assert!(lines[0]["timestamp"].is_string());
}

#[tokio::test]
async fn test_connection_check_uses_small_model() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "small-model",
            "max_tokens": 5,
            "messages": [{"role": "user", "content": "Hello"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hi")))
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_bridge(bridge_config(&upstream, &dir), &upstream).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/test-connection"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["model_used"], "small-model");
    assert_eq!(body["response_id"], "chatcmpl-int1");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_connection_check_failure_is_503_with_suggestions() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": {"message": "Invalid API key", "type": "auth_error"}})),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_bridge(bridge_config(&upstream, &dir), &upstream).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/test-connection"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error_type"], "authentication_error");
    assert!(body["message"].as_str().unwrap().contains("Invalid API key"));
    assert_eq!(body["suggestions"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_health_reports_missing_credentials() {
    let upstream = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let config = bridge_config(&upstream, &dir);
    let event_log = SharedEventLog::open(&config.event_log).unwrap();
    let keyless = HttpTransport::new(reqwest::Client::new(), &upstream.uri(), None, HashMap::new());
    let app = build_router(Arc::new(AppState::new(config, keyless, event_log)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["api_key_configured"], false);
}
