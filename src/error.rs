//! Error types for the bridge.
//!
//! [`NormalizedError`] is the single taxonomy shared by the converters, the
//! upstream client and the stream translator. [`BridgeError`] wraps it together
//! with the process-level failures (config, IO, parsing) the binary can hit.

use crate::translate::anthropic_types::ErrorResponse;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed inbound content, e.g. an undecodable image payload.
    InvalidContent,
    /// Inbound shape the converter cannot map to the upstream protocol.
    UnsupportedContent,
    /// Tool-call arguments that are not valid JSON. Never fatal.
    ToolArgumentDecode,
    UpstreamTransport,
    UpstreamProvider,
    /// Any failure after streaming has begun.
    Stream,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidContent => "invalid content",
            ErrorKind::UnsupportedContent => "unsupported content",
            ErrorKind::ToolArgumentDecode => "tool argument decode error",
            ErrorKind::UpstreamTransport => "upstream transport error",
            ErrorKind::UpstreamProvider => "upstream provider error",
            ErrorKind::Stream => "stream error",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub http_status: Option<u16>,
    pub message: String,
    pub retryable: bool,
}

impl NormalizedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            http_status: None,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn invalid_content(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidContent, msg)
    }

    pub fn unsupported_content(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedContent, msg)
    }

    pub fn tool_argument_decode(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolArgumentDecode, msg)
    }

    /// Network-level failure: connection refused, reset, timed out.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(ErrorKind::UpstreamTransport, msg)
        }
    }

    /// Provider answered with an error status. 5xx, 408 and 429 are retryable.
    pub fn provider(status: u16, msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::UpstreamProvider,
            http_status: Some(status),
            message: msg.into(),
            retryable: status >= 500 || status == 408 || status == 429,
        }
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Stream, msg)
    }

    /// Mark the error as final: no further attempts will be made.
    #[must_use]
    pub fn exhausted(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// HTTP status to answer the inbound caller with.
    pub fn client_status(&self) -> u16 {
        match self.kind {
            ErrorKind::InvalidContent | ErrorKind::UnsupportedContent => 400,
            ErrorKind::UpstreamProvider => self.http_status.filter(|s| *s >= 400).unwrap_or(502),
            ErrorKind::ToolArgumentDecode
            | ErrorKind::UpstreamTransport
            | ErrorKind::Stream => 502,
        }
    }

    /// Anthropic error type string for the envelope.
    pub fn anthropic_error_type(&self) -> &'static str {
        match self.kind {
            ErrorKind::InvalidContent | ErrorKind::UnsupportedContent => "invalid_request_error",
            ErrorKind::UpstreamProvider => match self.http_status {
                Some(400) => "invalid_request_error",
                Some(401) => "authentication_error",
                Some(403) => "permission_error",
                Some(404) => "not_found_error",
                Some(413) => "request_too_large",
                Some(429) => "rate_limit_error",
                Some(503 | 529) => "overloaded_error",
                _ => "api_error",
            },
            ErrorKind::ToolArgumentDecode | ErrorKind::UpstreamTransport | ErrorKind::Stream => {
                "api_error"
            }
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.anthropic_error_type(), &self.message)
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Normalized(#[from] NormalizedError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
