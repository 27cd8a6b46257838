//! Turn an inbound Messages request into a [`CanonicalRequest`].
//!
//! Every content block is classified; image payloads are validated up front so
//! a malformed image rejects the request before any upstream call.
//!
//! When an image is present and context stripping is enabled, the system prompt
//! is dropped and the text sitting next to an image in the same message is cut
//! down to a short prefix. This is lossy on purpose: it bounds what the (usually
//! smaller) vision model has to read. Messages without images are untouched.

use base64::Engine;

use super::anthropic_types::{self as wire, ImageSource, MessageContent, MessagesRequest};
use super::canonical::{CanonicalMessage, CanonicalRequest, ContentBlock, ToolDefinition};
use crate::config::VisionConfig;
use crate::error::NormalizedError;

const SYSTEM_REMINDER_PREFIX: &str = "<system-reminder>";

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub strip_image_context: bool,
    /// Characters kept from each text block sharing a message with an image.
    pub image_text_limit: usize,
}

impl NormalizeOptions {
    pub fn from_config(vision: &VisionConfig) -> Self {
        Self {
            strip_image_context: vision.strip_context,
            image_text_limit: vision.text_limit,
        }
    }
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self::from_config(&VisionConfig::default())
    }
}

pub fn normalize(
    req: &MessagesRequest,
    opts: &NormalizeOptions,
) -> Result<CanonicalRequest, NormalizedError> {
    let mut messages = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        let content = match &msg.content {
            MessageContent::Text(text) => vec![ContentBlock::Text { text: text.clone() }],
            MessageContent::Blocks(blocks) => normalize_blocks(blocks)?,
        };
        messages.push(CanonicalMessage {
            role: msg.role,
            content,
        });
    }

    let image_present = messages.iter().any(CanonicalMessage::has_image);

    let mut system = req
        .system
        .as_ref()
        .map(wire::SystemContent::as_text)
        .filter(|s| !s.trim().is_empty());

    if image_present && opts.strip_image_context {
        if system.take().is_some() {
            tracing::debug!("Dropped system prompt for image request");
        }
        for msg in messages.iter_mut().filter(|m| m.has_image()) {
            strip_image_siblings(&mut msg.content, opts.image_text_limit);
        }
    }

    let tools = req
        .tools
        .iter()
        .flatten()
        .map(|t| ToolDefinition {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.input_schema.clone(),
        })
        .collect();

    Ok(CanonicalRequest {
        model: req.model.clone(),
        route: None,
        system,
        messages,
        tools,
        tool_choice: req.tool_choice.clone(),
        max_tokens: req.max_tokens.clone(),
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: req.stop_sequences.clone().unwrap_or_default(),
        stream: req.stream.unwrap_or(false),
        user: req.metadata.as_ref().and_then(|m| m.user_id.clone()),
        image_present,
    })
}

fn normalize_blocks(blocks: &[wire::ContentBlock]) -> Result<Vec<ContentBlock>, NormalizedError> {
    let mut out = Vec::with_capacity(blocks.len());
    for block in blocks {
        if let Some(normalized) = normalize_block(block)? {
            out.push(normalized);
        }
    }
    Ok(out)
}

/// `Ok(None)` for blocks that are accepted but never forwarded (thinking).
fn normalize_block(block: &wire::ContentBlock) -> Result<Option<ContentBlock>, NormalizedError> {
    let normalized = match block {
        wire::ContentBlock::Text { text } => ContentBlock::Text { text: text.clone() },
        wire::ContentBlock::Image { source } => validate_image(source)?,
        wire::ContentBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        wire::ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: match content {
                None => Vec::new(),
                Some(wire::ToolResultContent::Text(text)) => {
                    vec![ContentBlock::Text { text: text.clone() }]
                }
                Some(wire::ToolResultContent::Blocks(blocks)) => normalize_blocks(blocks)?,
            },
            is_error: is_error.unwrap_or(false),
        },
        wire::ContentBlock::Thinking { .. } | wire::ContentBlock::RedactedThinking { .. } => {
            return Ok(None)
        }
    };
    Ok(Some(normalized))
}

fn validate_image(source: &ImageSource) -> Result<ContentBlock, NormalizedError> {
    if source.source_type != "base64" {
        return Err(NormalizedError::unsupported_content(format!(
            "image source type '{}' is not supported, send base64 data",
            source.source_type
        )));
    }
    if !source.media_type.starts_with("image/") {
        return Err(NormalizedError::invalid_content(format!(
            "image media type '{}' is not an image type",
            source.media_type
        )));
    }

    let payload: String = source
        .data
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if payload.is_empty() {
        return Err(NormalizedError::invalid_content("image payload is empty"));
    }
    base64::engine::general_purpose::STANDARD
        .decode(&payload)
        .map_err(|e| {
            NormalizedError::invalid_content(format!("image payload is not valid base64: {e}"))
        })?;

    Ok(ContentBlock::Image {
        media_type: source.media_type.clone(),
        data: payload,
    })
}

fn strip_image_siblings(content: &mut Vec<ContentBlock>, limit: usize) {
    content.retain(|block| match block {
        ContentBlock::Text { text } => {
            let trimmed = text.trim_start();
            !trimmed.is_empty() && !trimmed.starts_with(SYSTEM_REMINDER_PREFIX)
        }
        _ => true,
    });

    for block in content.iter_mut() {
        if let ContentBlock::Text { text } = block {
            if let Some((cut, _)) = text.char_indices().nth(limit) {
                tracing::debug!(
                    original_chars = text.chars().count(),
                    kept_chars = limit,
                    "Truncated text next to image"
                );
                text.truncate(cut);
            }
        }
    }
}
