//! Messages request → chat-completions request.

use serde_json::{Map, Value};

use super::canonical::{ContentBlock, MessageContent, MessagesRequest, Role, Tool, ToolChoice};
use super::foreign::{
    ChatContent, ChatMessage, ChatRequest, ChatTool, ChatToolCall, ContentPart, FunctionCall,
    FunctionDef, ImageUrl, StreamOptions,
};

/// String formats kept on `type: "string"` schema nodes.
const SUPPORTED_STRING_FORMATS: &[&str] = &["date-time", "enum"];

/// Resolve the backend model name from a `source:target,...` mapping.
///
/// The first pair whose source occurs in `requested` wins. Blank entries and
/// entries that are not exactly one `source:target` pair are skipped.
pub fn map_model(requested: &str, mapping: Option<&str>, default_model: &str) -> String {
    let Some(mapping) = mapping else {
        return default_model.to_string();
    };

    for pair in mapping.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let parts: Vec<&str> = pair.split(':').collect();
        if parts.len() != 2 {
            continue;
        }
        let source = parts[0].trim();
        let target = parts[1].trim();
        if source.is_empty() || target.is_empty() {
            continue;
        }
        if requested.contains(source) {
            return target.to_string();
        }
    }

    default_model.to_string()
}

/// Strip schema keywords strict backends reject.
///
/// `$schema` and `additionalProperties` are dropped at every level; `format`
/// is dropped from string nodes unless it is a supported format.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut cleaned: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| key.as_str() != "$schema" && key.as_str() != "additionalProperties")
                .map(|(key, value)| (key.clone(), sanitize_schema(value)))
                .collect();

            let is_string = cleaned.get("type").and_then(Value::as_str) == Some("string");
            let unsupported_format = cleaned
                .get("format")
                .map(|f| {
                    f.as_str()
                        .map_or(true, |f| !SUPPORTED_STRING_FORMATS.contains(&f))
                })
                .unwrap_or(false);
            if is_string && unsupported_format {
                cleaned.remove("format");
            }

            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn convert_tool(tool: &Tool) -> ChatTool {
    ChatTool {
        kind: "function".to_string(),
        function: FunctionDef {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: sanitize_schema(&tool.input_schema),
        },
    }
}

pub fn convert_tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Auto | ToolChoice::Any => Some(Value::String("auto".to_string())),
        ToolChoice::Tool { name } => Some(serde_json::json!({
            "type": "function",
            "function": { "name": name }
        })),
        ToolChoice::Other => None,
    }
}

fn tool_result_text(content: &Option<Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn convert_user(content: &MessageContent, out: &mut Vec<ChatMessage>) {
    let blocks = match content {
        MessageContent::Text(text) => {
            out.push(ChatMessage::text("user", text.clone()));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => out.push(ChatMessage {
                role: "tool".to_string(),
                content: Some(ChatContent::Text(tool_result_text(content))),
                tool_calls: None,
                tool_call_id: Some(tool_use_id.clone()),
            }),
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", source.media_type, source.data),
                },
            }),
            ContentBlock::ToolUse { .. } | ContentBlock::Unknown => {}
        }
    }

    if !parts.is_empty() {
        out.push(ChatMessage {
            role: "user".to_string(),
            content: Some(ChatContent::Parts(parts)),
            tool_calls: None,
            tool_call_id: None,
        });
    }
}

fn convert_assistant(content: &MessageContent, out: &mut Vec<ChatMessage>) {
    let mut texts: Vec<&str> = Vec::new();
    let mut tool_calls = Vec::new();

    match content {
        MessageContent::Text(text) => texts.push(text),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => texts.push(text),
                    ContentBlock::ToolUse { id, name, input } => {
                        let arguments = match input {
                            Some(value) if !value.is_null() => value.to_string(),
                            _ => "{}".to_string(),
                        };
                        tool_calls.push(ChatToolCall {
                            id: id.clone(),
                            kind: "function".to_string(),
                            function: FunctionCall {
                                name: name.clone(),
                                arguments,
                            },
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    let text = texts.join("\n");
    out.push(ChatMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty()).then_some(ChatContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    });
}

/// Translate a messages request for a chat-completions backend.
///
/// The result always streams and asks the backend to report usage, whatever
/// the client asked for.
pub fn to_chat_request(req: &MessagesRequest, model: String) -> ChatRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = &req.system {
        let text = system.text();
        if !text.is_empty() {
            messages.push(ChatMessage::text("system", text));
        }
    }

    for message in &req.messages {
        match message.role {
            Role::User => convert_user(&message.content, &mut messages),
            Role::Assistant => convert_assistant(&message.content, &mut messages),
        }
    }

    let tools = req
        .tools
        .as_ref()
        .filter(|tools| !tools.is_empty())
        .map(|tools| tools.iter().map(convert_tool).collect());

    ChatRequest {
        model,
        messages,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.clone(),
        tools,
        tool_choice: req.tool_choice.as_ref().and_then(convert_tool_choice),
        stream: true,
        stream_options: Some(StreamOptions {
            include_usage: true,
        }),
    }
}
