//! HTTP request handlers.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use std::time::Instant;

use super::dispatcher::{dispatch, RelayRequest};
use super::server::AppState;
use crate::error::Error;
use crate::router::check_model_permission;
use crate::storage::ApiKeyRecord;
use crate::transform::canonical::MessagesRequest;

/// Header name for the request correlation ID.
pub const REQUEST_ID_HEADER: &str = "x-ccrelay-request-id";

/// Header clients may use instead of a bearer token.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Relay key presented by the client: `x-api-key`, else a bearer token.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.trim()).filter(|k| !k.is_empty());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<ApiKeyRecord, Error> {
    let key = presented_key(headers).ok_or(Error::Unauthorized)?;
    match state.directory.find_api_key(key).await? {
        Some(record) if !record.enabled => {
            tracing::info!(api_key_id = record.id, "Rejected disabled API key");
            Err(Error::Unauthorized)
        }
        Some(record) if record.is_expired(Utc::now()) => {
            tracing::info!(api_key_id = record.id, "Rejected expired API key");
            Err(Error::Unauthorized)
        }
        Some(record) => Ok(record),
        None => Err(Error::Unauthorized),
    }
}

fn attach_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

/// Handle POST /v1/messages
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Error> {
    let started = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();

    let mut response = match execute_request(&state, headers, body, &request_id, started).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, status = %e.status(), "Request rejected");
            e.into_response()
        }
    };
    attach_request_id(&mut response, &request_id);
    Ok(response)
}

/// Authenticate, parse and authorize, then hand off to the dispatcher.
async fn execute_request(
    state: &AppState,
    headers: HeaderMap,
    body: Bytes,
    request_id: &str,
    started: Instant,
) -> Result<Response, Error> {
    let api_key = authenticate(state, &headers).await?;
    let parsed: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::BadRequest(format!("malformed request body: {}", e)))?;
    check_model_permission(&api_key, &parsed.model)?;

    tracing::info!(
        request_id = %request_id,
        api_key_id = api_key.id,
        group_id = api_key.group_id,
        model = %parsed.model,
        stream = parsed.stream,
        "Received messages request"
    );

    dispatch(
        state,
        RelayRequest {
            request_id: request_id.to_string(),
            api_key,
            headers,
            raw_body: body,
            parsed,
            started,
        },
    )
    .await
}

/// Handle GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ccrelay"
    }))
}
