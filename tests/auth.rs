//! Integration tests for key checks that happen before any upstream call.

mod common;

use axum::body::Body;
use chrono::{Duration, Utc};
use http::Request;
use tower::ServiceExt;

use common::{messages_body, parse_body, post_messages, setup};

#[tokio::test]
async fn test_missing_or_unknown_key_is_401() {
    let relay = setup().await;

    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(messages_body("claude-sonnet-4-20250514", false)))
        .unwrap();
    let (status, body) = parse_body(relay.app.clone().oneshot(request).await.unwrap()).await;
    assert_eq!(status, http::StatusCode::UNAUTHORIZED);
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "authentication_error");

    let request = Request::post("/v1/messages")
        .header("authorization", "Bearer cr-nope")
        .body(Body::from(messages_body("claude-sonnet-4-20250514", false)))
        .unwrap();
    let response = relay.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_bearer_token_is_accepted() {
    let relay = setup().await;

    // No accounts in the group: getting past auth means a 503.
    let request = Request::post("/v1/messages")
        .header("authorization", format!("Bearer {}", common::TEST_KEY))
        .body(Body::from(messages_body("claude-sonnet-4-20250514", false)))
        .unwrap();
    let (status, body) = parse_body(relay.app.clone().oneshot(request).await.unwrap()).await;
    assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["type"], "no_available_account");
}

#[tokio::test]
async fn test_restricted_key_rejects_other_models() {
    let relay = setup().await;
    relay
        .store
        .insert_api_key("haiku-only", "cr-haiku", 1, Some("claude-3-5-haiku-20241022"))
        .await
        .unwrap();

    let request = Request::post("/v1/messages")
        .header("x-api-key", "cr-haiku")
        .body(Body::from(messages_body("claude-opus-4-20250514", false)))
        .unwrap();
    let (status, body) = parse_body(relay.app.clone().oneshot(request).await.unwrap()).await;
    assert_eq!(status, http::StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["type"], "permission_error");
}

#[tokio::test]
async fn test_expired_key_is_401() {
    let relay = setup().await;
    relay
        .store
        .set_api_key_expiry(relay.api_key_id, Some(Utc::now() - Duration::minutes(1)))
        .await
        .unwrap();

    let (status, body) = parse_body(
        relay
            .app
            .clone()
            .oneshot(post_messages(messages_body("claude-sonnet-4-20250514", false)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, http::StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["type"], "authentication_error");

    // A later expiry lets the key through to selection (no accounts: 503).
    relay
        .store
        .set_api_key_expiry(relay.api_key_id, Some(Utc::now() + Duration::days(1)))
        .await
        .unwrap();
    let response = relay
        .app
        .clone()
        .oneshot(post_messages(messages_body("claude-sonnet-4-20250514", false)))
        .await
        .unwrap();
    assert_eq!(response.status(), http::StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_malformed_body_is_400() {
    let relay = setup().await;

    let (status, body) = parse_body(
        relay
            .app
            .clone()
            .oneshot(post_messages("{\"model\": 5}".to_string()))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, http::StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_health_endpoint() {
    let relay = setup().await;
    let request = Request::get("/health").body(Body::empty()).unwrap();
    let (status, body) = parse_body(relay.app.clone().oneshot(request).await.unwrap()).await;
    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
