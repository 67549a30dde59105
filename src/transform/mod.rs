//! Translation between the messages protocol and the chat-completions protocol.

pub mod canonical;
pub mod foreign;
pub mod request;
pub mod response;
pub mod stream;

pub use request::{map_model, sanitize_schema, to_chat_request};
pub use response::{to_messages_response, ChatStreamAggregator};
pub use stream::{translate_stream, StreamTransformer};

/// Fresh message id for responses the relay synthesizes.
pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}
