//! Chat-completions response → messages response (non-streaming).

use std::collections::BTreeMap;

use serde_json::Value;

use super::canonical::{MessagesResponse, ResponseBlock, StopReason, Usage};
use super::foreign::{
    ChatChoice, ChatChunk, ChatResponse, ChatResponseMessage, ChatToolCall, ChatUsage,
    FunctionCall,
};
use super::new_message_id;
use crate::sse::SseLines;

/// Translate a complete chat-completions response.
///
/// `model` is the model the client asked for, not the backend model.
pub fn to_messages_response(resp: &ChatResponse, model: &str) -> MessagesResponse {
    let id = if resp.id.is_empty() {
        new_message_id()
    } else {
        resp.id.clone()
    };
    let mut out = MessagesResponse::new(id, model);

    let choice = resp.choices.first();
    if let Some(choice) = choice {
        if let Some(text) = choice.message.content.as_deref().filter(|t| !t.is_empty()) {
            out.content.push(ResponseBlock::Text {
                text: text.to_string(),
            });
        }
        for call in choice.message.tool_calls.iter().flatten() {
            let input = match serde_json::from_str::<Value>(&call.function.arguments) {
                Ok(value @ Value::Object(_)) => value,
                _ => Value::Object(Default::default()),
            };
            out.content.push(ResponseBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input,
            });
        }
    }

    out.stop_reason = Some(StopReason::from_finish_reason(
        choice.and_then(|c| c.finish_reason.as_deref()),
    ));
    let usage = resp.usage.unwrap_or_default();
    out.usage = Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        ..Usage::default()
    };
    out
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Folds a chat-completions stream into one [`ChatResponse`], for clients
/// that did not ask to stream.
#[derive(Debug, Default)]
pub struct ChatStreamAggregator {
    lines: SseLines,
    id: String,
    model: String,
    text: String,
    tools: BTreeMap<u32, PartialToolCall>,
    finish_reason: Option<String>,
    usage: Option<ChatUsage>,
}

impl ChatStreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        for data in self.lines.push(chunk) {
            self.apply_data(&data);
        }
    }

    fn apply_data(&mut self, data: &str) {
        if data == "[DONE]" {
            return;
        }
        let chunk: ChatChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unparseable chat chunk");
                return;
            }
        };

        if self.id.is_empty() {
            if let Some(id) = chunk.id {
                self.id = id;
            }
        }
        if self.model.is_empty() {
            if let Some(model) = chunk.model {
                self.model = model;
            }
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                self.text.push_str(&text);
            }
            for delta in choice.delta.tool_calls.into_iter().flatten() {
                let entry = self.tools.entry(delta.index).or_default();
                if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                    entry.id = id;
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                        entry.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        entry.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
    }

    /// Flush any trailing line and build the aggregated response.
    pub fn finish(mut self) -> ChatResponse {
        if let Some(data) = self.lines.finish() {
            self.apply_data(&data);
        }

        let tool_calls: Vec<ChatToolCall> = std::mem::take(&mut self.tools)
            .into_values()
            .filter(|call| !call.id.is_empty() && !call.name.is_empty())
            .map(|call| ChatToolCall {
                id: call.id,
                kind: "function".to_string(),
                function: FunctionCall {
                    name: call.name,
                    arguments: call.arguments,
                },
            })
            .collect();

        ChatResponse {
            id: self.id,
            model: self.model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatResponseMessage {
                    content: (!self.text.is_empty()).then_some(self.text),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
        }
    }
}
