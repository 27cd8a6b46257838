use serde_json::Value;

use super::anthropic_types::{MessagesResponse, ResponseContentBlock, Usage};
use super::openai_types::ChatCompletionResponse;
use crate::error::NormalizedError;

/// Translate an OpenAI Chat Completion response into an Anthropic Messages response.
/// `model` is the routed upstream model reported back to the client.
pub fn openai_to_anthropic(resp: &ChatCompletionResponse, model: &str) -> MessagesResponse {
    let choice = resp.choices.first();

    let mut content: Vec<ResponseContentBlock> = Vec::new();

    if let Some(c) = choice {
        // Reasoning models sometimes leave `content` empty and answer in `reasoning_content`
        let text = c
            .message
            .content
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| c.message.reasoning_content.as_deref().filter(|t| !t.is_empty()));
        if let Some(text) = text {
            content.push(ResponseContentBlock::Text {
                text: text.to_string(),
            });
        }

        for tc in c.message.tool_calls.iter().flatten() {
            let (input, decode_error) = decode_tool_arguments(&tc.function.arguments);
            if let Some(ref reason) = decode_error {
                tracing::warn!(tool = %tc.function.name, %reason, "Tool arguments were not valid JSON");
            }
            let id = if tc.id.is_empty() {
                new_tool_use_id()
            } else {
                tc.id.clone()
            };
            content.push(ResponseContentBlock::ToolUse {
                id,
                name: tc.function.name.clone(),
                input,
                decode_error,
            });
        }
    }

    // Anthropic clients expect non-empty content
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map_or("end_turn", map_finish_reason);

    let usage = resp.usage.as_ref().map_or_else(Usage::default, |u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: None,
    });

    MessagesResponse {
        id: message_id(&resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage,
    }
}

/// Map OpenAI finish_reason to Anthropic stop_reason.
pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "stop" | "content_filter" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        other => {
            tracing::warn!(finish_reason = other, "Unknown finish_reason, treating as end_turn");
            "end_turn"
        }
    }
}

/// Parse an accumulated tool-argument string.
///
/// Empty input is an empty object. Invalid JSON also becomes an empty object,
/// with the parse error returned alongside so the caller can surface it.
pub fn decode_tool_arguments(raw: &str) -> (Value, Option<String>) {
    if raw.trim().is_empty() {
        return (Value::Object(Default::default()), None);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => (value, None),
        Err(e) => {
            let err =
                NormalizedError::tool_argument_decode(format!("arguments are not valid JSON: {e}"));
            (Value::Object(Default::default()), Some(err.to_string()))
        }
    }
}

/// `msg_` + the upstream id (sans `chatcmpl-`), or a fresh UUID when absent.
pub fn message_id(upstream_id: &str) -> String {
    let trimmed = upstream_id.trim_start_matches("chatcmpl-");
    if trimmed.is_empty() {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    } else {
        format!("msg_{trimmed}")
    }
}

pub fn new_tool_use_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}
