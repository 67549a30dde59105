//! Per-client request limit on the relay endpoint.
//!
//! Fixed windows keyed by client IP. A client over its budget gets a 429 in
//! the messages-protocol error envelope; admitted responses carry the
//! remaining budget.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Error;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Tracked clients above which expired windows are swept.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Counts requests per client in fixed windows.
#[derive(Debug)]
pub struct ClientRateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Window>,
}

impl ClientRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    /// Count one request from `client` at `now`.
    ///
    /// Returns the budget left in the current window, or `None` when the
    /// request is over the limit. Rejected requests do not count.
    pub fn check(&self, client: &str, now: Instant) -> Option<u32> {
        if self.windows.len() > SWEEP_THRESHOLD {
            self.windows
                .retain(|_, w| now.duration_since(w.started) < self.window);
        }

        let mut window = self.windows.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }
        if window.count >= self.limit {
            return None;
        }
        window.count += 1;
        Some(self.limit - window.count)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

/// Client address: first `x-forwarded-for` hop, then `x-real-ip`, then the
/// peer address of the connection.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(String::from)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn set_budget_headers(response: &mut Response, limit: u32, remaining: u32) {
    let headers = response.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
}

/// Middleware rejecting clients over their per-window budget.
pub async fn limit_by_client(
    State(limiter): State<Arc<ClientRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client = client_ip(request.headers(), peer);

    match limiter.check(&client, Instant::now()) {
        Some(remaining) => {
            let mut response = next.run(request).await;
            set_budget_headers(&mut response, limiter.limit(), remaining);
            response
        }
        None => {
            tracing::warn!(client = %client, limit = limiter.limit(), "Client rate limit exceeded");
            let mut response = Error::TooManyRequests.into_response();
            set_budget_headers(&mut response, limiter.limit(), 0);
            response
        }
    }
}
