//! State machine for translating OpenAI streaming chunks into Anthropic SSE events.
//!
//! The [`StreamTranslator`] is fed one upstream `ChatCompletionChunk` at a time
//! by the proxy loop and returns the Anthropic events to emit for it. It does no
//! I/O, so a synthetic chunk sequence fully exercises its transition table.
//!
//! ```text
//! Idle -> Started -> (ContentOpen <-> ContentClosed)* -> Done
//!    \________\______________\______________________-> Errored
//! ```
//!
//! At most one content block is open at a time. Tool-call arguments are passed
//! through fragment by fragment and also buffered per tool call; the buffer is
//! parsed only when the block closes, and the parsed value rides on the
//! `content_block_stop` event. A delta starts a new tool call when its index is
//! new or when it carries an id different from the call already on that index.

use std::collections::BTreeMap;

use super::anthropic_types::{
    Delta, DeltaUsage, ErrorBody, MessageDeltaBody, MessagesResponse, ResponseContentBlock,
    StreamEvent, Usage,
};
use super::openai_types::{ChatCompletionChunk, ChunkToolCall};
use super::response::{decode_tool_arguments, map_finish_reason, message_id, new_tool_use_id};
use crate::error::NormalizedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Started,
    ContentOpen,
    ContentClosed,
    Done,
    Errored,
}

impl StreamPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamPhase::Done | StreamPhase::Errored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text { index: usize },
    Tool { tool_index: u32 },
}

/// Argument buffer for the latest tool call seen on an upstream index.
#[derive(Debug, Default)]
struct ToolSlot {
    upstream_id: Option<String>,
    block_index: usize,
    args: String,
}

#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    phase: StreamPhase,
    open: Option<OpenBlock>,
    next_index: usize,
    tools: BTreeMap<u32, ToolSlot>,
    usage: DeltaUsage,
    stop_reason: Option<&'static str>,
}

impl StreamTranslator {
    /// `model` is the routed upstream model reported in `message_start`.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            phase: StreamPhase::Idle,
            open: None,
            next_index: 0,
            tools: BTreeMap::new(),
            usage: DeltaUsage::default(),
            stop_reason: None,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// Process a single upstream chunk, returning zero or more Anthropic events.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.phase.is_terminal() {
            return Vec::new();
        }

        let mut events = Vec::new();

        // Usage usually arrives on its own trailing chunk with empty choices
        if let Some(ref usage) = chunk.usage {
            self.usage = DeltaUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }

        if self.phase == StreamPhase::Idle {
            events.push(self.message_start(&chunk.id));
            self.phase = StreamPhase::Started;
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if self.stop_reason.is_some() {
            tracing::debug!("Ignoring content after finish_reason");
            return events;
        }

        // Reasoning models (DeepSeek R1, Kimi, GLM) may stream the answer in
        // `reasoning_content` and leave `content` empty.
        let text = choice
            .delta
            .content
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| choice.delta.reasoning_content.as_deref().filter(|s| !s.is_empty()));
        if let Some(text) = text {
            self.push_text(text, &mut events);
        }

        for tc in choice.delta.tool_calls.iter().flatten() {
            self.push_tool_delta(tc, &mut events);
        }

        if let Some(ref reason) = choice.finish_reason {
            self.close_open_block(&mut events);
            self.stop_reason = Some(map_finish_reason(reason));
        }

        events
    }

    /// Upstream completed (`[DONE]` or end of body): close whatever is open and
    /// emit `message_delta` + `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.phase.is_terminal() {
            return Vec::new();
        }

        let mut events = Vec::new();
        if self.phase == StreamPhase::Idle {
            events.push(self.message_start(""));
        }
        self.close_open_block(&mut events);

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(self.stop_reason.unwrap_or("end_turn").to_string()),
                stop_sequence: None,
            },
            usage: self.usage.clone(),
        });
        events.push(StreamEvent::MessageStop);

        self.phase = StreamPhase::Done;
        events
    }

    /// Terminate the stream with an error. Any open block is closed first so a
    /// strict consumer never sees an unterminated block.
    pub fn fail(&mut self, err: &NormalizedError) -> Vec<StreamEvent> {
        if self.phase.is_terminal() {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.close_open_block(&mut events);
        events.push(StreamEvent::Error {
            error: ErrorBody {
                error_type: err.anthropic_error_type().to_string(),
                message: err.message.clone(),
            },
        });

        self.phase = StreamPhase::Errored;
        events
    }

    fn push_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        let index = match self.open {
            Some(OpenBlock::Text { index }) => index,
            _ => {
                self.close_open_block(events);
                let index = self.allocate_block();
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ResponseContentBlock::Text {
                        text: String::new(),
                    },
                });
                self.open = Some(OpenBlock::Text { index });
                index
            }
        };

        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn push_tool_delta(&mut self, tc: &ChunkToolCall, events: &mut Vec<StreamEvent>) {
        let tool_index = tc.index;
        let upstream_id = tc.id.as_deref().filter(|id| !id.is_empty());

        // Some providers reuse index 0 (or omit it) for every call and only the id changes
        let starts_call = match self.tools.get(&tool_index) {
            None => true,
            Some(slot) => upstream_id.is_some_and(|id| slot.upstream_id.as_deref() != Some(id)),
        };

        if !starts_call && self.open != Some(OpenBlock::Tool { tool_index }) {
            tracing::warn!(tool_index, "Dropping fragment for an already closed tool call");
            return;
        }

        if starts_call {
            self.close_open_block(events);

            let id = upstream_id.map_or_else(new_tool_use_id, str::to_string);
            let name = tc
                .function
                .as_ref()
                .and_then(|f| f.name.clone())
                .unwrap_or_default();

            let block_index = self.allocate_block();
            events.push(StreamEvent::ContentBlockStart {
                index: block_index,
                content_block: ResponseContentBlock::ToolUse {
                    id,
                    name,
                    input: serde_json::Value::Object(serde_json::Map::new()),
                    decode_error: None,
                },
            });
            self.tools.insert(
                tool_index,
                ToolSlot {
                    upstream_id: upstream_id.map(str::to_string),
                    block_index,
                    args: String::new(),
                },
            );
            self.open = Some(OpenBlock::Tool { tool_index });
        }

        let Some(fragment) = tc
            .function
            .as_ref()
            .and_then(|f| f.arguments.as_deref())
            .filter(|a| !a.is_empty())
        else {
            return;
        };
        if let Some(slot) = self.tools.get_mut(&tool_index) {
            slot.args.push_str(fragment);
            events.push(StreamEvent::ContentBlockDelta {
                index: slot.block_index,
                delta: Delta::InputJsonDelta {
                    partial_json: fragment.to_string(),
                },
            });
        }
    }

    fn allocate_block(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.phase = StreamPhase::ContentOpen;
        index
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        match self.open.take() {
            None => return,
            Some(OpenBlock::Text { index }) => events.push(StreamEvent::ContentBlockStop {
                index,
                input: None,
                decode_error: None,
            }),
            Some(OpenBlock::Tool { tool_index }) => {
                if let Some(slot) = self.tools.get(&tool_index) {
                    let (input, decode_error) = decode_tool_arguments(&slot.args);
                    if let Some(ref reason) = decode_error {
                        tracing::warn!(tool_index, %reason, "Streamed tool arguments were not valid JSON");
                    }
                    events.push(StreamEvent::ContentBlockStop {
                        index: slot.block_index,
                        input: Some(input),
                        decode_error,
                    });
                }
            }
        }
        self.phase = StreamPhase::ContentClosed;
    }

    fn message_start(&self, upstream_id: &str) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessagesResponse {
                id: message_id(upstream_id),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        }
    }
}
