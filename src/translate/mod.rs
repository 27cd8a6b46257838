//! API translation between Anthropic and `OpenAI` formats.
//!
//! Inbound requests are normalized into a canonical form, routed to an upstream
//! model, then converted. Responses and stream chunks go the other way. All
//! translation functions are pure (no I/O).

pub mod anthropic_types;
pub mod canonical;
pub mod context;
pub mod normalize;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod router;
pub mod streaming;
