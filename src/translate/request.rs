//! Translate a [`CanonicalRequest`] into an OpenAI Chat Completions request.
//!
//! Handles system prompts, multi-part content (text, images), tool use, tool
//! results and tool choice mapping. A single inbound message can expand into
//! several upstream messages: a user turn carrying `tool_result` blocks becomes
//! `tool`-role messages followed by the user's own text.

use serde_json::Value;

use super::anthropic_types::{Role, ToolChoice};
use super::canonical::{CanonicalMessage, CanonicalRequest, ContentBlock, ToolDefinition};
use super::context::{available_completion_tokens, trim_to_fit, COMPLETION_RESERVE};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatFunctionName, ChatMessage, ChatTool,
    ChatToolCall, ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction, ContentPart,
    ImageUrlDetail, StreamOptions,
};
use crate::config::{BridgeConfig, TokenLimits};
use crate::error::NormalizedError;

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    pub disable_tools: bool,
    /// Image requests go out without tools and with `tool_choice: "none"`.
    pub vision_drops_tools: bool,
}

impl ConvertOptions {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            disable_tools: config.disable_tools,
            vision_drops_tools: config.vision.drop_tools,
        }
    }
}

pub fn canonical_to_openai(
    canon: &CanonicalRequest,
    limits: &TokenLimits,
    opts: &ConvertOptions,
) -> Result<ChatCompletionRequest, NormalizedError> {
    let mut messages = Vec::new();

    if let Some(ref system) = canon.system {
        messages.push(ChatMessage::text("system", system.trim()));
    }

    for msg in &canon.messages {
        translate_message(msg, &mut messages)?;
    }

    let window = limits.context_window(canon.route);
    let dropped = trim_to_fit(&mut messages, window, COMPLETION_RESERVE);
    if dropped > 0 {
        tracing::warn!(
            dropped,
            model = %canon.model,
            window,
            "Trimmed oldest messages to fit context window"
        );
    }

    let clamped = clamp_max_tokens(canon.max_tokens.as_ref(), limits);
    let max_tokens = clamped.min(available_completion_tokens(&messages, window));
    if max_tokens < clamped {
        tracing::info!(clamped, max_tokens, "Reduced max_tokens to fit context window");
    }

    let vision_without_tools = canon.image_present && opts.vision_drops_tools;
    let tools: Vec<ChatTool> = if opts.disable_tools || vision_without_tools {
        Vec::new()
    } else {
        canon
            .tools
            .iter()
            .filter(|t| !t.name.trim().is_empty())
            .map(translate_tool)
            .collect()
    };

    let tool_choice = if !tools.is_empty() {
        canon.tool_choice.as_ref().map(translate_tool_choice)
    } else if vision_without_tools {
        Some(ChatToolChoice::Mode("none".to_string()))
    } else {
        None
    };

    Ok(ChatCompletionRequest {
        model: canon.model.clone(),
        messages,
        max_tokens: Some(max_tokens),
        temperature: canon.temperature,
        top_p: canon.top_p,
        stream: canon.stream,
        stream_options: canon.stream.then_some(StreamOptions {
            include_usage: true,
        }),
        tools: (!tools.is_empty()).then_some(tools),
        tool_choice,
        stop: (!canon.stop_sequences.is_empty()).then(|| canon.stop_sequences.clone()),
        user: canon.user.clone(),
    })
}

/// Resolve the client's `max_tokens` against the configured limits.
///
/// Absent, non-numeric or below-minimum values become the minimum; values above
/// the ceiling become the ceiling; anything in range passes through.
pub fn clamp_max_tokens(requested: Option<&Value>, limits: &TokenLimits) -> u64 {
    let parsed = requested.and_then(parse_token_count);
    let used = match parsed {
        Some(n) if n < i128::from(limits.min_tokens) => limits.min_tokens,
        Some(n) if n > i128::from(limits.max_tokens) => limits.max_tokens,
        Some(n) => n as u64,
        None => limits.min_tokens,
    };

    if parsed != Some(i128::from(used)) {
        tracing::info!(?requested, used, "Clamped max_tokens");
    }
    used
}

fn parse_token_count(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i128)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn translate_message(msg: &CanonicalMessage, out: &mut Vec<ChatMessage>) -> Result<(), NormalizedError> {
    match msg.role {
        Role::User => translate_user_message(&msg.content, out),
        Role::Assistant => {
            out.push(translate_assistant_message(&msg.content)?);
            Ok(())
        }
        Role::System => {
            let mut texts = Vec::new();
            for block in &msg.content {
                match block {
                    ContentBlock::Text { text } => texts.push(text.as_str()),
                    ContentBlock::Image { .. }
                    | ContentBlock::ToolUse { .. }
                    | ContentBlock::ToolResult { .. } => {
                        return Err(NormalizedError::unsupported_content(
                            "system messages may only contain text",
                        ))
                    }
                }
            }
            out.push(ChatMessage::text("system", texts.join("\n")));
            Ok(())
        }
    }
}

fn translate_user_message(blocks: &[ContentBlock], out: &mut Vec<ChatMessage>) -> Result<(), NormalizedError> {
    let mut parts: Vec<ContentPart> = Vec::new();
    let mut tool_outputs: Vec<ChatMessage> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { media_type, data } => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrlDetail {
                    url: format!("data:{media_type};base64,{data}"),
                    detail: None,
                },
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => tool_outputs.push(ChatMessage::tool_output(
                tool_use_id.clone(),
                tool_result_text(content, *is_error)?,
            )),
            ContentBlock::ToolUse { .. } => {
                return Err(NormalizedError::unsupported_content(
                    "tool_use blocks are only valid in assistant messages",
                ))
            }
        }
    }

    // Tool outputs must directly follow the assistant turn that requested them.
    let had_tool_outputs = !tool_outputs.is_empty();
    out.append(&mut tool_outputs);

    if !parts.is_empty() {
        out.push(ChatMessage {
            content: Some(collapse_content_parts(parts)),
            ..ChatMessage::text("user", "")
        });
    } else if !had_tool_outputs {
        out.push(ChatMessage::text("user", ""));
    }

    Ok(())
}

fn translate_assistant_message(blocks: &[ContentBlock]) -> Result<ChatMessage, NormalizedError> {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ChatToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            ContentBlock::Image { .. } => {
                return Err(NormalizedError::unsupported_content(
                    "image blocks are not supported in assistant messages",
                ))
            }
            ContentBlock::ToolResult { .. } => {
                return Err(NormalizedError::unsupported_content(
                    "tool_result blocks are only valid in user messages",
                ))
            }
        }
    }

    let content = if text_parts.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(ChatContent::Text(text_parts.concat()))
    };

    Ok(ChatMessage {
        role: "assistant".to_string(),
        content,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    })
}

/// Plain string unless an image forces the array form.
fn collapse_content_parts(parts: Vec<ContentPart>) -> ChatContent {
    if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. })) {
        return ChatContent::Parts(parts);
    }
    let texts: Vec<String> = parts
        .into_iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text),
            ContentPart::ImageUrl { .. } => None,
        })
        .collect();
    ChatContent::Text(texts.join("\n"))
}

fn tool_result_text(content: &[ContentBlock], is_error: bool) -> Result<String, NormalizedError> {
    let mut texts = Vec::with_capacity(content.len());
    for block in content {
        match block {
            ContentBlock::Text { text } => texts.push(text.as_str()),
            ContentBlock::Image { .. } => {
                return Err(NormalizedError::unsupported_content(
                    "image blocks inside tool_result cannot be sent upstream",
                ))
            }
            ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. } => {
                return Err(NormalizedError::unsupported_content(
                    "tool_result content may only contain text",
                ))
            }
        }
    }

    let body = if texts.is_empty() {
        "No content provided".to_string()
    } else {
        texts.join("\n")
    };

    Ok(if is_error { format!("ERROR: {body}") } else { body })
}

fn translate_tool(tool: &ToolDefinition) -> ChatTool {
    ChatTool {
        tool_type: "function".to_string(),
        function: ChatFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

fn translate_tool_choice(tc: &ToolChoice) -> ChatToolChoice {
    match tc {
        ToolChoice::Auto => ChatToolChoice::Mode("auto".to_string()),
        ToolChoice::Any => ChatToolChoice::Mode("required".to_string()),
        ToolChoice::None => ChatToolChoice::Mode("none".to_string()),
        ToolChoice::Tool { name } => ChatToolChoice::Function(ChatToolChoiceFunction {
            choice_type: "function".to_string(),
            function: ChatFunctionName { name: name.clone() },
        }),
    }
}
