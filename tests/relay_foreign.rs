//! Integration tests for relaying to chat-completions accounts.
//!
//! The client speaks the messages protocol; the `wiremock` upstream speaks
//! chat completions. Checks the outbound translation, the translated event
//! stream and the usage booked from it.

mod common;

use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ccrelay::storage::{NewAccount, Platform};
use common::{
    event_names, event_payloads, messages_body, parse_body, post_messages, read_body, setup,
};

const CLIENT_MODEL: &str = "claude-sonnet-4-20250514";

const TEXT_STREAM: &str = concat!(
    "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
    "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
    "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4o-mini\",\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":4}}\n\n",
    "data: [DONE]\n\n",
);

const TOOL_STREAM: &str = concat!(
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"\"}}]}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"city\\\":\"}}]}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"Oslo\\\"}\"}}]}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
    "data: [DONE]\n\n",
);

async fn foreign_account(relay: &common::TestRelay, url: &str) -> i64 {
    relay
        .store
        .insert_account(
            &NewAccount::new("oa-1", Platform::Foreign, "sk-upstream", 1)
                .request_url(url)
                .model_mapping("haiku:gpt-4o-mini, sonnet:gpt-4o-mini"),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_streaming_text_is_translated() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-upstream"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "stream_options": {"include_usage": true}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(TEXT_STREAM, "text/event-stream"))
        .expect(1)
        .mount(&upstream)
        .await;

    let relay = setup().await;
    let account_id = foreign_account(&relay, &format!("{}/v1", upstream.uri())).await;

    let response = relay
        .app
        .clone()
        .oneshot(post_messages(messages_body(CLIENT_MODEL, true)))
        .await
        .unwrap();
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let (status, body) = read_body(response).await;
    assert_eq!(status, http::StatusCode::OK);

    assert_eq!(
        event_names(&body),
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    let payloads = event_payloads(&body);
    assert_eq!(payloads[0]["message"]["model"], CLIENT_MODEL);
    assert_eq!(payloads[2]["delta"]["text"], "Hel");
    assert_eq!(payloads[3]["delta"]["text"], "lo");
    assert_eq!(payloads[5]["delta"]["stop_reason"], "end_turn");
    assert_eq!(payloads[5]["usage"]["input_tokens"], 12);
    assert_eq!(payloads[5]["usage"]["output_tokens"], 4);

    relay.settle().await;
    let account = relay.store.get_account(account_id).await.unwrap().unwrap();
    assert_eq!(account.today.usage_count, 1);
    assert_eq!(account.today.input_tokens, 12);
    assert_eq!(account.today.output_tokens, 4);
}

#[tokio::test]
async fn test_streaming_tool_call_is_translated() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(TOOL_STREAM, "text/event-stream"))
        .mount(&upstream)
        .await;

    let relay = setup().await;
    foreign_account(&relay, &format!("{}/v1", upstream.uri())).await;

    let body = json!({
        "model": CLIENT_MODEL,
        "max_tokens": 256,
        "stream": true,
        "messages": [{"role": "user", "content": "Weather in Oslo?"}],
        "tools": [{
            "name": "get_weather",
            "description": "Current weather",
            "input_schema": {
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "properties": {"city": {"type": "string", "format": "city-name"}},
                "additionalProperties": false
            }
        }]
    });
    let response = relay
        .app
        .clone()
        .oneshot(post_messages(body.to_string()))
        .await
        .unwrap();
    let (_, body) = read_body(response).await;

    let payloads = event_payloads(&body);
    let tool_start = payloads
        .iter()
        .find(|p| p["type"] == "content_block_start" && p["content_block"]["type"] == "tool_use")
        .expect("tool block started");
    assert_eq!(tool_start["index"], 1);
    assert_eq!(tool_start["content_block"]["id"], "call_a");
    assert_eq!(tool_start["content_block"]["name"], "get_weather");

    let args: String = payloads
        .iter()
        .filter(|p| p["type"] == "content_block_delta" && p["index"] == 1)
        .filter_map(|p| p["delta"]["partial_json"].as_str())
        .collect();
    assert_eq!(args, "{\"city\":\"Oslo\"}");

    let stop = payloads
        .iter()
        .find(|p| p["type"] == "message_delta")
        .expect("message_delta");
    assert_eq!(stop["delta"]["stop_reason"], "tool_use");

    let sent: Vec<wiremock::Request> = upstream.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(
        sent["tools"][0]["function"]["parameters"],
        json!({"type": "object", "properties": {"city": {"type": "string"}}})
    );
}

#[tokio::test]
async fn test_non_streaming_client_gets_aggregated_message() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(TEXT_STREAM, "text/event-stream"))
        .expect(1)
        .mount(&upstream)
        .await;

    let relay = setup().await;
    foreign_account(&relay, &format!("{}/v1", upstream.uri())).await;

    let response = relay
        .app
        .clone()
        .oneshot(post_messages(messages_body(CLIENT_MODEL, false)))
        .await
        .unwrap();
    let (status, body) = parse_body(response).await;

    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["type"], "message");
    assert_eq!(body["model"], CLIENT_MODEL);
    assert_eq!(body["content"], json!([{"type": "text", "text": "Hello"}]));
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 12);
}

#[tokio::test]
async fn test_json_reply_is_translated() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-9",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Sure"},
                "finish_reason": "length"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1}
        })))
        .mount(&upstream)
        .await;

    let relay = setup().await;
    foreign_account(&relay, &format!("{}/v1", upstream.uri())).await;

    let response = relay
        .app
        .clone()
        .oneshot(post_messages(messages_body("claude-opus-4-20250514", false)))
        .await
        .unwrap();
    let (status, body) = parse_body(response).await;

    assert_eq!(status, http::StatusCode::OK);
    assert_eq!(body["id"], "chatcmpl-9");
    assert_eq!(body["content"][0]["text"], "Sure");
    assert_eq!(body["stop_reason"], "max_tokens");

    // No mapping pair matches "opus": the default foreign model is used.
    let sent = upstream.received_requests().await.unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(sent["model"], "gpt-4o");
}

#[tokio::test]
async fn test_foreign_error_is_passed_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"message": "You exceed your account's rate limit", "type": "requests"}
        })))
        .mount(&upstream)
        .await;

    let relay = setup().await;
    let account_id = foreign_account(&relay, &format!("{}/v1", upstream.uri())).await;

    let response = relay
        .app
        .clone()
        .oneshot(post_messages(messages_body(CLIENT_MODEL, true)))
        .await
        .unwrap();
    let (status, body) = parse_body(response).await;
    assert_eq!(status, http::StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["type"], "requests");

    relay.settle().await;
    let account = relay.store.get_account(account_id).await.unwrap().unwrap();
    assert_eq!(
        account.current_status,
        ccrelay::storage::AccountStatus::RateLimited
    );
    assert!(account.rate_limit_end_time.is_some());
}
