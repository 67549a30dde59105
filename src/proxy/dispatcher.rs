//! Per-request relay flow: select an account, call it, return its answer.
//!
//! Accounting never runs on the response path. Every exit, including a
//! client that hangs up before headers arrive, ends in exactly one
//! [`Completion`] handed to the bookkeeper.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use std::time::Instant;

use super::bookkeeping::{Bookkeeper, Completion};
use super::server::AppState;
use super::upstream::{build_request, copy_response_headers};
use crate::error::{Error, Result};
use crate::health::classify;
use crate::storage::{Account, ApiKeyRecord, HealthUpdate, Platform, RequestOutcome};
use crate::transform::canonical::MessagesRequest;
use crate::transform::foreign::ChatResponse;
use crate::transform::{
    map_model, to_chat_request, to_messages_response, translate_stream, ChatStreamAggregator,
};
use crate::usage::{tap_stream, StreamEnd, TokenUsage};

/// Status recorded when the client disconnects before the upstream answers.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// An authenticated, parsed client request.
pub struct RelayRequest {
    pub request_id: String,
    pub api_key: ApiKeyRecord,
    pub headers: HeaderMap,
    /// Body exactly as the client sent it; forwarded untouched to
    /// messages-protocol accounts.
    pub raw_body: Bytes,
    pub parsed: MessagesRequest,
    pub started: Instant,
}

/// Identity of one relayed request, used to build its [`Completion`].
#[derive(Clone)]
struct Ledger {
    bookkeeper: Bookkeeper,
    request_id: String,
    account_id: i64,
    api_key_id: i64,
    model: String,
    streaming: bool,
    started: Instant,
}

impl Ledger {
    fn record(
        &self,
        status: u16,
        outcome: RequestOutcome,
        usage: TokenUsage,
        health: Option<HealthUpdate>,
    ) {
        self.bookkeeper.submit(Completion {
            request_id: self.request_id.clone(),
            account_id: Some(self.account_id),
            api_key_id: Some(self.api_key_id),
            model: self.model.clone(),
            streaming: self.streaming,
            usage,
            status,
            outcome,
            health,
            duration_ms: self.started.elapsed().as_millis() as i64,
            finished_at: Utc::now(),
        });
    }

    /// Record a transport failure and hand back the error for the client.
    fn transport_failure(&self, err: reqwest::Error) -> Error {
        let err = Error::from(err);
        let (status, outcome) = match err {
            Error::Timeout => (StatusCode::REQUEST_TIMEOUT.as_u16(), RequestOutcome::Timeout),
            _ => (StatusCode::BAD_GATEWAY.as_u16(), RequestOutcome::NetworkError),
        };
        tracing::warn!(
            request_id = %self.request_id,
            account_id = self.account_id,
            error = %err,
            "Upstream request failed"
        );
        self.record(status, outcome, TokenUsage::default(), None);
        err
    }

    /// Callback for a tapped response stream.
    fn on_stream_end(
        self,
        status: u16,
        health: Option<HealthUpdate>,
    ) -> impl FnOnce(TokenUsage, StreamEnd) + Send + 'static {
        move |usage, end| {
            let outcome = match end {
                StreamEnd::Completed => RequestOutcome::Completed,
                StreamEnd::Aborted => RequestOutcome::Aborted,
                StreamEnd::Failed => RequestOutcome::NetworkError,
                StreamEnd::TimedOut => RequestOutcome::Timeout,
            };
            self.record(status, outcome, usage, health);
        }
    }
}

/// Records an abort if dropped while still armed.
struct PendingGuard {
    ledger: Ledger,
    armed: bool,
}

impl PendingGuard {
    fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            armed: true,
        }
    }

    fn disarm(mut self) -> Ledger {
        self.armed = false;
        self.ledger.clone()
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::info!(
            request_id = %self.ledger.request_id,
            "Client went away before upstream answered"
        );
        self.ledger.record(
            CLIENT_CLOSED_REQUEST,
            RequestOutcome::Aborted,
            TokenUsage::default(),
            None,
        );
    }
}

/// Relay one request to an account of the key's group.
///
/// Upstream non-2xx answers come back as `Ok` responses carrying the
/// upstream status, headers and body.
pub async fn dispatch(state: &AppState, request: RelayRequest) -> Result<Response> {
    let RelayRequest {
        request_id,
        api_key,
        headers,
        raw_body,
        parsed,
        started,
    } = request;
    let relay = &state.config.relay;

    let account = state
        .selector
        .select(api_key.group_id, &parsed.model, Utc::now())
        .await?;
    let client = state.clients.client_for(&account)?;

    let (body, upstream_streams) = match account.platform {
        Platform::Native | Platform::Console => (raw_body.to_vec(), parsed.stream),
        Platform::Foreign => {
            let target = map_model(
                &parsed.model,
                account.model_mapping.as_deref(),
                &relay.default_foreign_model,
            );
            tracing::debug!(request_id = %request_id, from = %parsed.model, to = %target, "Mapped model");
            let chat = to_chat_request(&parsed, target);
            let body = serde_json::to_vec(&chat)
                .map_err(|e| Error::Internal(format!("failed to encode upstream request: {}", e)))?;
            (body, chat.stream)
        }
    };
    let upstream_request =
        build_request(&client, &account, relay, &headers, body, upstream_streams)?;

    tracing::info!(
        request_id = %request_id,
        account_id = account.id,
        account = %account.name,
        platform = %account.platform,
        stream = parsed.stream,
        "Forwarding request"
    );

    let guard = PendingGuard::new(Ledger {
        bookkeeper: state.bookkeeper.clone(),
        request_id,
        account_id: account.id,
        api_key_id: api_key.id,
        model: parsed.model.clone(),
        streaming: parsed.stream,
        started,
    });

    let response = match upstream_request.send().await {
        Ok(response) => response,
        Err(e) => return Err(guard.disarm().transport_failure(e)),
    };

    let status = response.status();
    let response_headers = copy_response_headers(response.headers());

    if !status.is_success() {
        return relay_error(guard, &account, status, response_headers, response).await;
    }

    let health = classify(
        status.as_u16(),
        response.headers(),
        None,
        account.platform,
        Utc::now(),
    );

    match (account.platform, parsed.stream) {
        (Platform::Native | Platform::Console, true) => {
            let ledger = guard.disarm();
            let body = tap_stream(
                response.bytes_stream(),
                ledger.on_stream_end(status.as_u16(), health),
            );
            Ok(build_response(status, response_headers, Body::from_stream(body)))
        }
        (Platform::Native | Platform::Console, false) => {
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => return Err(guard.disarm().transport_failure(e)),
            };
            let usage = TokenUsage::from_message_body(&body).unwrap_or_default();
            guard
                .disarm()
                .record(status.as_u16(), RequestOutcome::Completed, usage, health);
            Ok(build_response(status, response_headers, Body::from(body)))
        }
        (Platform::Foreign, true) => {
            let ledger = guard.disarm();
            let translated = translate_stream(response.bytes_stream(), parsed.model.clone());
            let body = tap_stream(translated, ledger.on_stream_end(status.as_u16(), health));
            Ok(build_response(
                StatusCode::OK,
                event_stream_headers(),
                Body::from_stream(body),
            ))
        }
        (Platform::Foreign, false) => {
            let is_json = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.contains("application/json"));
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => return Err(guard.disarm().transport_failure(e)),
            };
            let ledger = guard.disarm();

            let chat = if is_json {
                match serde_json::from_slice::<ChatResponse>(&body) {
                    Ok(chat) => chat,
                    Err(e) => {
                        ledger.record(
                            StatusCode::BAD_GATEWAY.as_u16(),
                            RequestOutcome::NetworkError,
                            TokenUsage::default(),
                            None,
                        );
                        return Err(Error::Network(format!(
                            "unreadable upstream response: {}",
                            e
                        )));
                    }
                }
            } else {
                let mut aggregator = ChatStreamAggregator::new();
                aggregator.feed(&body);
                aggregator.finish()
            };

            let message = to_messages_response(&chat, &parsed.model);
            let usage = TokenUsage {
                input_tokens: message.usage.input_tokens,
                output_tokens: message.usage.output_tokens,
                model: parsed.model.clone(),
                ..TokenUsage::default()
            };
            let encoded = serde_json::to_vec(&message)
                .map_err(|e| Error::Internal(format!("failed to encode response: {}", e)))?;
            ledger.record(status.as_u16(), RequestOutcome::Completed, usage, health);

            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            Ok(build_response(StatusCode::OK, headers, Body::from(encoded)))
        }
    }
}

/// Pass a non-2xx upstream answer through and queue its health transition.
async fn relay_error(
    guard: PendingGuard,
    account: &Account,
    status: StatusCode,
    headers: HeaderMap,
    response: reqwest::Response,
) -> Result<Response> {
    let upstream_headers = response.headers().clone();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => return Err(guard.disarm().transport_failure(e)),
    };
    let ledger = guard.disarm();

    let health = classify(
        status.as_u16(),
        &upstream_headers,
        Some(&body[..]),
        account.platform,
        Utc::now(),
    );
    tracing::warn!(
        request_id = %ledger.request_id,
        account_id = account.id,
        status = status.as_u16(),
        ?health,
        body = %String::from_utf8_lossy(&body),
        "Upstream returned error"
    );
    ledger.record(
        status.as_u16(),
        RequestOutcome::UpstreamError,
        TokenUsage::default(),
        health,
    );

    Ok(build_response(status, headers, Body::from(body)))
}

fn event_stream_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
