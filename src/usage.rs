//! Token usage extraction from messages-protocol responses.
//!
//! [`UsageExtractor`] parses SSE lines incrementally. [`tap_stream`] hands
//! every chunk to the consumer before parsing it, so a parsing problem can
//! never alter or delay the bytes a client sees.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::sse::SseLines;

/// Token counts reported for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub model: String,
}

impl TokenUsage {
    /// Parse usage from a buffered, non-streaming message body.
    ///
    /// Returns `None` when the body is not a JSON object carrying `usage`.
    pub fn from_message_body(body: &[u8]) -> Option<Self> {
        let message: MessageUsage = serde_json::from_slice(body).ok()?;
        let usage = message.usage?;
        Some(Self {
            input_tokens: usage.input_tokens.unwrap_or(0),
            output_tokens: usage.output_tokens.unwrap_or(0),
            cache_read_input_tokens: usage.cache_read_input_tokens.unwrap_or(0),
            cache_creation_input_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
            model: message.model.unwrap_or_default(),
        })
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessageUsage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum UsageEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageUsage },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<RawUsage>,
    },
    #[serde(other)]
    Other,
}

/// Incremental SSE usage parser. One per stream.
#[derive(Debug, Default)]
pub struct UsageExtractor {
    lines: SseLines,
    usage: TokenUsage,
}

impl UsageExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, processing every complete line it closes.
    pub fn feed(&mut self, chunk: &[u8]) {
        for data in self.lines.push(chunk) {
            self.process_data(&data);
        }
    }

    /// Flush a trailing partial line (once) and return the accumulated usage.
    pub fn finish(&mut self) -> TokenUsage {
        if let Some(data) = self.lines.finish() {
            self.process_data(&data);
        }
        self.usage.clone()
    }

    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    fn process_data(&mut self, data: &str) {
        if data == "[DONE]" {
            return;
        }

        match serde_json::from_str::<UsageEvent>(data) {
            Ok(UsageEvent::MessageStart { message }) => {
                if let Some(model) = message.model {
                    self.usage.model = model;
                }
                if let Some(usage) = message.usage {
                    self.usage.input_tokens = usage.input_tokens.unwrap_or(0);
                    self.usage.output_tokens = usage.output_tokens.unwrap_or(0);
                    self.usage.cache_read_input_tokens = usage.cache_read_input_tokens.unwrap_or(0);
                    self.usage.cache_creation_input_tokens =
                        usage.cache_creation_input_tokens.unwrap_or(0);
                }
            }
            Ok(UsageEvent::MessageDelta { usage: Some(usage) }) => {
                self.usage.output_tokens += usage.output_tokens.unwrap_or(0);
                overwrite_if_positive(&mut self.usage.input_tokens, usage.input_tokens);
                overwrite_if_positive(
                    &mut self.usage.cache_read_input_tokens,
                    usage.cache_read_input_tokens,
                );
                overwrite_if_positive(
                    &mut self.usage.cache_creation_input_tokens,
                    usage.cache_creation_input_tokens,
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::trace!(error = %e, "Skipping unparseable SSE data line");
            }
        }
    }
}

fn overwrite_if_positive(target: &mut u64, value: Option<u64>) {
    if let Some(v) = value.filter(|v| *v > 0) {
        *target = v;
    }
}

/// Errors a tapped stream may end with.
pub trait StreamError {
    fn is_timeout(&self) -> bool;
}

impl StreamError for reqwest::Error {
    fn is_timeout(&self) -> bool {
        reqwest::Error::is_timeout(self)
    }
}

impl StreamError for std::io::Error {
    fn is_timeout(&self) -> bool {
        self.kind() == std::io::ErrorKind::TimedOut
    }
}

/// How a tapped stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The upstream body ended normally.
    Completed,
    /// The upstream body yielded an error.
    Failed,
    /// The upstream body stalled past the request timeout.
    TimedOut,
    /// The consumer dropped the stream before it ended.
    Aborted,
}

struct CompletionGuard<F>
where
    F: FnOnce(TokenUsage, StreamEnd),
{
    extractor: UsageExtractor,
    pending: Option<Bytes>,
    end: StreamEnd,
    on_complete: Option<F>,
}

impl<F> CompletionGuard<F>
where
    F: FnOnce(TokenUsage, StreamEnd),
{
    fn parse_pending(&mut self) {
        if let Some(chunk) = self.pending.take() {
            self.extractor.feed(&chunk);
        }
    }
}

impl<F> Drop for CompletionGuard<F>
where
    F: FnOnce(TokenUsage, StreamEnd),
{
    fn drop(&mut self) {
        self.parse_pending();
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(self.extractor.finish(), self.end);
        }
    }
}

/// Forward `upstream` unchanged while extracting usage from it.
///
/// Each chunk is yielded before it is parsed; parsing happens when the consumer
/// polls for the next item. `on_complete` runs exactly once with the final
/// usage, also when the consumer drops the stream mid-way.
pub fn tap_stream<S, E, F>(upstream: S, on_complete: F) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: StreamError + Send + 'static,
    F: FnOnce(TokenUsage, StreamEnd) + Send + 'static,
{
    async_stream::stream! {
        let mut guard = CompletionGuard {
            extractor: UsageExtractor::new(),
            pending: None,
            end: StreamEnd::Aborted,
            on_complete: Some(on_complete),
        };
        let mut upstream = Box::pin(upstream);
        let mut failed = false;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    guard.pending = Some(chunk.clone());
                    yield Ok(chunk);
                    guard.parse_pending();
                }
                Err(e) => {
                    failed = true;
                    guard.end = if e.is_timeout() {
                        StreamEnd::TimedOut
                    } else {
                        StreamEnd::Failed
                    };
                    yield Err(e);
                    break;
                }
            }
        }

        if !failed {
            guard.end = StreamEnd::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    const STREAM: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1,\"cache_read_input_tokens\":3,\"cache_creation_input_tokens\":2}}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n",
        "\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":5}}\n",
        "\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n",
        "\n",
    );

    fn extract_in_chunks(input: &[u8], sizes: &[usize]) -> TokenUsage {
        let mut extractor = UsageExtractor::new();
        let mut offset = 0;
        let mut i = 0;
        while offset < input.len() {
            let size = sizes[i % sizes.len()].max(1);
            let end = (offset + size).min(input.len());
            extractor.feed(&input[offset..end]);
            offset = end;
            i += 1;
        }
        extractor.finish()
    }

    #[test]
    fn test_extracts_start_and_delta() {
        let usage = extract_in_chunks(STREAM.as_bytes(), &[STREAM.len()]);
        assert_eq!(usage.model, "claude-sonnet-4-20250514");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 6);
        assert_eq!(usage.cache_read_input_tokens, 3);
        assert_eq!(usage.cache_creation_input_tokens, 2);
    }

    #[test]
    fn test_chunking_does_not_change_result() {
        let whole = extract_in_chunks(STREAM.as_bytes(), &[STREAM.len()]);
        for sizes in [&[1usize][..], &[2], &[3, 7], &[17, 1, 64], &[5, 200]] {
            assert_eq!(
                extract_in_chunks(STREAM.as_bytes(), sizes),
                whole,
                "chunk sizes {:?}",
                sizes
            );
        }
    }

    #[test]
    fn test_delta_accumulation_and_zero_does_not_overwrite() {
        let input = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"m\",\"usage\":{\"input_tokens\":9,\"output_tokens\":0}}}\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":5}}\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7,\"input_tokens\":0}}\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":0,\"cache_read_input_tokens\":0}}\n",
        );
        let usage = extract_in_chunks(input.as_bytes(), &[input.len()]);
        assert_eq!(usage.output_tokens, 12);
        assert_eq!(usage.input_tokens, 9);
        assert_eq!(usage.cache_read_input_tokens, 0);
    }

    #[test]
    fn test_delta_positive_input_overwrites() {
        let input = concat!(
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"m\",\"usage\":{\"input_tokens\":0}}}\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":4,\"input_tokens\":21,\"cache_creation_input_tokens\":8}}\n",
        );
        let usage = extract_in_chunks(input.as_bytes(), &[input.len()]);
        assert_eq!(usage.input_tokens, 21);
        assert_eq!(usage.cache_creation_input_tokens, 8);
        assert_eq!(usage.output_tokens, 4);
    }

    #[test]
    fn test_ignores_noise_lines() {
        let input = concat!(
            ": keep-alive\n",
            "\n",
            "data: [DONE]\n",
            "data: not json at all\n",
            "data:{\"type\":\"message_start\",\"message\":{\"model\":\"m\",\"usage\":{\"input_tokens\":2}}}\r\n",
            "event: ping\n",
        );
        let usage = extract_in_chunks(input.as_bytes(), &[4]);
        assert_eq!(usage.input_tokens, 2);
        assert_eq!(usage.model, "m");
    }

    #[test]
    fn test_trailing_partial_line_flushed_once() {
        let mut extractor = UsageExtractor::new();
        extractor.feed(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":3}}");
        assert_eq!(extractor.usage().output_tokens, 0);

        assert_eq!(extractor.finish().output_tokens, 3);
        assert_eq!(extractor.finish().output_tokens, 3);
    }

    #[test]
    fn test_from_message_body() {
        let body = br#"{"id":"msg_1","type":"message","model":"claude-3-5-haiku-20241022","content":[],"usage":{"input_tokens":11,"output_tokens":4,"cache_read_input_tokens":1}}"#;
        let usage = TokenUsage::from_message_body(body).unwrap();
        assert_eq!(usage.model, "claude-3-5-haiku-20241022");
        assert_eq!(usage.input_tokens, 11);
        assert_eq!(usage.output_tokens, 4);
        assert_eq!(usage.cache_read_input_tokens, 1);
        assert_eq!(usage.cache_creation_input_tokens, 0);
        assert_eq!(usage.total_tokens(), 16);

        assert!(TokenUsage::from_message_body(b"not json").is_none());
        assert!(TokenUsage::from_message_body(br#"{"model":"m"}"#).is_none());
    }

    #[tokio::test]
    async fn test_tap_stream_passthrough_and_completion() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = STREAM
            .as_bytes()
            .chunks(29)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();

        let tapped = tap_stream(futures::stream::iter(chunks), move |usage, end| {
            *seen_cb.lock().unwrap() = Some((usage, end));
        });
        let out: Vec<Bytes> = tapped.map(|r| r.unwrap()).collect().await;

        let joined: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(joined, STREAM.as_bytes());

        let (usage, end) = seen.lock().unwrap().take().unwrap();
        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 6);
    }

    #[tokio::test]
    async fn test_tap_stream_reports_abort_with_partial_usage() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = STREAM
            .split_inclusive("\n\n")
            .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
            .collect();
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();

        let mut tapped = Box::pin(tap_stream(futures::stream::iter(chunks), move |usage, end| {
            *seen_cb.lock().unwrap() = Some((usage, end));
        }));
        // Only the message_start event reaches the client.
        let first = tapped.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"event: message_start"));
        drop(tapped);

        let (usage, end) = seen.lock().unwrap().take().unwrap();
        assert_eq!(end, StreamEnd::Aborted);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 1);
    }

    #[tokio::test]
    async fn test_tap_stream_reports_upstream_failure() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":2}}\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();

        let tapped = tap_stream(futures::stream::iter(chunks), move |usage, end| {
            *seen_cb.lock().unwrap() = Some((usage, end));
        });
        let out: Vec<Result<Bytes, std::io::Error>> = tapped.collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());

        let (usage, end) = seen.lock().unwrap().take().unwrap();
        assert_eq!(end, StreamEnd::Failed);
        assert_eq!(usage.output_tokens, 2);
    }

    #[tokio::test]
    async fn test_tap_stream_reports_timeout() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":4}}}\n",
            )),
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "stalled")),
        ];
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();

        let tapped = tap_stream(futures::stream::iter(chunks), move |usage, end| {
            *seen_cb.lock().unwrap() = Some((usage, end));
        });
        let _: Vec<Result<Bytes, std::io::Error>> = tapped.collect().await;

        let (usage, end) = seen.lock().unwrap().take().unwrap();
        assert_eq!(end, StreamEnd::TimedOut);
        assert_eq!(usage.input_tokens, 4);
    }
}
