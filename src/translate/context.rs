//! Rough prompt-size estimation and context-window trimming.
//!
//! Estimates are deliberately pessimistic: providers tokenize differently and
//! an over-long prompt fails the whole request.

use super::anthropic_types::{self as wire, MessageContent, MessagesRequest};
use super::openai_types::{ChatContent, ChatMessage, ContentPart};

const CHARS_PER_TOKEN: u64 = 4;
const IMAGE_TOKEN_ESTIMATE: u64 = 400;
/// Estimate is scaled by this percentage.
const ESTIMATE_BIAS_PERCENT: u64 = 135;
const ESTIMATE_BUFFER: u64 = 512;
/// Tokens held back for the completion when trimming.
pub const COMPLETION_RESERVE: u64 = 2048;

pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u64 {
    let mut chars = 0u64;
    let mut images = 0u64;

    for msg in messages {
        match &msg.content {
            Some(ChatContent::Text(text)) => chars += text.chars().count() as u64,
            Some(ChatContent::Parts(parts)) => {
                for part in parts {
                    match part {
                        ContentPart::Text { text } => chars += text.chars().count() as u64,
                        ContentPart::ImageUrl { .. } => images += 1,
                    }
                }
            }
            None => {}
        }
        for call in msg.tool_calls.iter().flatten() {
            chars += call.function.arguments.chars().count() as u64;
        }
    }

    let rough = chars / CHARS_PER_TOKEN + images * IMAGE_TOKEN_ESTIMATE;
    (rough * ESTIMATE_BIAS_PERCENT).div_ceil(100) + ESTIMATE_BUFFER
}

/// Drop the oldest non-system messages until the estimate fits
/// `context_window - reserve`. Tool outputs left without their call at the
/// head of the conversation go too. The newest message is always kept.
///
/// Returns the number of messages dropped.
pub fn trim_to_fit(messages: &mut Vec<ChatMessage>, context_window: u64, reserve: u64) -> usize {
    let budget = context_window.saturating_sub(reserve).max(1);
    let mut dropped = 0;

    while estimate_prompt_tokens(messages) > budget {
        let Some(oldest) = messages.iter().position(|m| m.role != "system") else {
            break;
        };
        if oldest + 1 >= messages.len() {
            break;
        }
        messages.remove(oldest);
        dropped += 1;

        while let Some(head) = messages.iter().position(|m| m.role != "system") {
            if messages[head].role != "tool" || head + 1 >= messages.len() {
                break;
            }
            messages.remove(head);
            dropped += 1;
        }
    }

    dropped
}

/// Output tokens still available once the prompt is in the window.
pub fn available_completion_tokens(messages: &[ChatMessage], context_window: u64) -> u64 {
    context_window
        .saturating_sub(estimate_prompt_tokens(messages))
        .saturating_sub(COMPLETION_RESERVE)
        .max(1)
}

/// Estimate for the `count_tokens` endpoint: four characters per token over
/// the system prompt and all text content.
pub fn count_request_tokens(req: &MessagesRequest) -> u64 {
    let mut chars = req
        .system
        .as_ref()
        .map_or(0, |s| s.as_text().chars().count());

    for msg in &req.messages {
        match &msg.content {
            MessageContent::Text(text) => chars += text.chars().count(),
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    chars += block_chars(block);
                }
            }
        }
    }

    ((chars as u64) / CHARS_PER_TOKEN).max(1)
}

fn block_chars(block: &wire::ContentBlock) -> usize {
    match block {
        wire::ContentBlock::Text { text } => text.chars().count(),
        wire::ContentBlock::Thinking { thinking, .. } => thinking.chars().count(),
        wire::ContentBlock::ToolUse { input, .. } => input.to_string().chars().count(),
        wire::ContentBlock::ToolResult { content, .. } => match content {
            Some(wire::ToolResultContent::Text(text)) => text.chars().count(),
            Some(wire::ToolResultContent::Blocks(blocks)) => blocks.iter().map(block_chars).sum(),
            None => 0,
        },
        wire::ContentBlock::Image { .. } | wire::ContentBlock::RedactedThinking { .. } => 0,
    }
}
