//! Chat-completions SSE → messages-protocol SSE, event by event.

use std::collections::BTreeMap;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use super::canonical::{
    BlockDelta, MessageDeltaBody, MessagesResponse, ResponseBlock, StopReason, StreamEvent, Usage,
};
use super::foreign::{ChatChunk, ToolCallDelta};
use super::new_message_id;
use crate::sse::SseLines;

const TEXT_BLOCK_INDEX: u32 = 0;

#[derive(Debug, Default)]
struct ToolState {
    id: Option<String>,
    name: Option<String>,
    /// Argument fragments received before the block could be started.
    pending_arguments: String,
    block_index: Option<u32>,
}

/// Per-connection translation state.
///
/// Block 0 is always the text block; tool calls get the following indices in
/// the order their id and name become known.
#[derive(Debug)]
pub struct StreamTransformer {
    message_id: String,
    model: String,
    started: bool,
    finished: bool,
    next_block_index: u32,
    tools: BTreeMap<u32, ToolState>,
    finish_reason: Option<String>,
    usage: Usage,
}

impl StreamTransformer {
    /// `model` is echoed in `message_start`; use the model the client asked for.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            message_id: new_message_id(),
            model: model.into(),
            started: false,
            finished: false,
            next_block_index: TEXT_BLOCK_INDEX + 1,
            tools: BTreeMap::new(),
            finish_reason: None,
            usage: Usage::default(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Handle one `data:` payload. `[DONE]` produces the closing events.
    pub fn push_data(&mut self, data: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.finish();
        }
        match serde_json::from_str::<ChatChunk>(data) {
            Ok(chunk) => self.on_chunk(chunk),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparseable chat chunk");
                Vec::new()
            }
        }
    }

    pub fn on_chunk(&mut self, chunk: ChatChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.ensure_started(&mut events);

        if let Some(usage) = chunk.usage {
            self.usage.input_tokens = usage.prompt_tokens;
            self.usage.output_tokens = usage.completion_tokens;
        }

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                events.push(StreamEvent::ContentBlockDelta {
                    index: TEXT_BLOCK_INDEX,
                    delta: BlockDelta::TextDelta { text },
                });
            }
            for delta in choice.delta.tool_calls.into_iter().flatten() {
                self.on_tool_delta(delta, &mut events);
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }

        events
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::MessageStart {
            message: MessagesResponse::new(self.message_id.clone(), self.model.clone()),
        });
        events.push(StreamEvent::ContentBlockStart {
            index: TEXT_BLOCK_INDEX,
            content_block: ResponseBlock::Text {
                text: String::new(),
            },
        });
    }

    fn on_tool_delta(&mut self, delta: ToolCallDelta, events: &mut Vec<StreamEvent>) {
        let state = self.tools.entry(delta.index).or_default();

        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            state.id = Some(id);
        }
        let (name, arguments) = match delta.function {
            Some(function) => (function.name, function.arguments),
            None => (None, None),
        };
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            state.name = Some(name);
        }

        if state.block_index.is_none() {
            if let (Some(id), Some(name)) = (&state.id, &state.name) {
                let index = self.next_block_index;
                self.next_block_index += 1;
                state.block_index = Some(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ResponseBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: Value::Object(Default::default()),
                    },
                });
                if !state.pending_arguments.is_empty() {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: std::mem::take(&mut state.pending_arguments),
                        },
                    });
                }
            }
        }

        if let Some(fragment) = arguments.filter(|a| !a.is_empty()) {
            match state.block_index {
                Some(index) => events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJsonDelta {
                        partial_json: fragment,
                    },
                }),
                None => state.pending_arguments.push_str(&fragment),
            }
        }
    }

    /// Closing events. Runs once; later calls return nothing.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.ensure_started(&mut events);
        self.finished = true;

        events.push(StreamEvent::ContentBlockStop {
            index: TEXT_BLOCK_INDEX,
        });
        let mut started: Vec<u32> = self.tools.values().filter_map(|t| t.block_index).collect();
        started.sort_unstable();
        for index in started {
            events.push(StreamEvent::ContentBlockStop { index });
        }

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: StopReason::from_finish_reason(self.finish_reason.as_deref()),
                stop_sequence: None,
            },
            usage: self.usage,
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

/// Rewrite a chat-completions SSE body into messages-protocol SSE.
///
/// Closing events are sent on `[DONE]`, or when the body ends without it. An
/// upstream error is passed through and ends the stream.
pub fn translate_stream<S, E>(upstream: S, model: String) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    async_stream::stream! {
        let mut transformer = StreamTransformer::new(model);
        let mut lines = SseLines::default();
        let mut upstream = Box::pin(upstream);
        let mut failed = false;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    for data in lines.push(&chunk) {
                        for event in transformer.push_data(&data) {
                            yield Ok(event.to_sse());
                        }
                    }
                    if transformer.is_finished() {
                        break;
                    }
                }
                Err(e) => {
                    failed = true;
                    yield Err(e);
                    break;
                }
            }
        }

        if !failed {
            if let Some(data) = lines.finish() {
                for event in transformer.push_data(&data) {
                    yield Ok(event.to_sse());
                }
            }
            for event in transformer.finish() {
                yield Ok(event.to_sse());
            }
        }
    }
}
