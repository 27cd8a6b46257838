//! Normalized internal form of an inbound request.
//!
//! Produced by [`normalize`](super::normalize::normalize), routed by
//! [`ModelRouter`](super::router::ModelRouter), consumed by
//! [`canonical_to_openai`](super::request::canonical_to_openai).

use super::anthropic_types::{Role, ToolChoice};
use super::router::RouteTarget;

/// One typed unit of message content. Adding a variant is a compile error in
/// every converter that matches on it.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Validated base64 payload.
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn is_image(&self) -> bool {
        matches!(self, ContentBlock::Image { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl CanonicalMessage {
    pub fn has_image(&self) -> bool {
        self.content.iter().any(|b| match b {
            ContentBlock::Image { .. } => true,
            ContentBlock::ToolResult { content, .. } => content.iter().any(ContentBlock::is_image),
            ContentBlock::Text { .. } | ContentBlock::ToolUse { .. } => false,
        })
    }
}

/// Passed through verbatim to the upstream function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    /// Requested model until routed, then the concrete upstream model.
    pub model: String,
    pub route: Option<RouteTarget>,
    pub system: Option<String>,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    /// Raw client value; clamped by the request converter.
    pub max_tokens: Option<serde_json::Value>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Vec<String>,
    pub stream: bool,
    pub user: Option<String>,
    pub image_present: bool,
}
