//! Shared setup for the relay integration tests.
//!
//! Each test gets its own SQLite file in a temp dir and a full router wired
//! through `AppState::new`; upstream providers are `wiremock` servers.

#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use http::Request;
use tempfile::TempDir;

use ccrelay::config::Config;
use ccrelay::proxy::{create_router, AppState};
use ccrelay::storage::{init_pool, NewAccount, Platform, SqliteStore};

pub const TEST_KEY: &str = "cr-test-key";

pub struct TestRelay {
    pub app: axum::Router,
    pub state: AppState,
    pub store: Arc<SqliteStore>,
    pub api_key_id: i64,
    _dir: TempDir,
}

impl TestRelay {
    /// Wait for the bookkeeping queue to drain.
    pub async fn settle(&self) {
        self.state.bookkeeper.flush().await;
    }

    pub async fn add_account(&self, name: &str, platform: Platform, url: &str) -> i64 {
        self.store
            .insert_account(&NewAccount::new(name, platform, "sk-upstream", 1).request_url(url))
            .await
            .expect("insert account")
    }
}

pub async fn setup() -> TestRelay {
    setup_with(Config::default()).await
}

pub async fn setup_with(config: Config) -> TestRelay {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("relay.db");
    let pool = init_pool(path.to_str().unwrap()).await.expect("init pool");
    let store = Arc::new(SqliteStore::new(pool));
    let api_key_id = store
        .insert_api_key("test", TEST_KEY, 1, None)
        .await
        .expect("insert key");

    let (state, _worker) =
        AppState::new(config, store.clone(), store.clone()).expect("build state");
    let app = create_router(state.clone());

    TestRelay {
        app,
        state,
        store,
        api_key_id,
        _dir: dir,
    }
}

/// A messages request for `model`.
pub fn messages_body(model: &str, stream: bool) -> String {
    serde_json::json!({
        "model": model,
        "max_tokens": 256,
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": stream
    })
    .to_string()
}

pub fn post_messages(body: String) -> Request<Body> {
    Request::post("/v1/messages")
        .header("content-type", "application/json")
        .header("x-api-key", TEST_KEY)
        .body(Body::from(body))
        .unwrap()
}

/// Read the whole body as bytes.
pub async fn read_body(response: axum::response::Response) -> (http::StatusCode, Vec<u8>) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 4 * 1_048_576)
        .await
        .expect("read body");
    (status, bytes.to_vec())
}

/// Parse the response body as JSON.
pub async fn parse_body(response: axum::response::Response) -> (http::StatusCode, serde_json::Value) {
    let (status, bytes) = read_body(response).await;
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or_default();
    (status, json)
}

/// Event names of an SSE body, in order.
pub fn event_names(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| line.strip_prefix("event: "))
        .map(String::from)
        .collect()
}

/// JSON payloads of an SSE body, in order.
pub fn event_payloads(body: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect()
}
