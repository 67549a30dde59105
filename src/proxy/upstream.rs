//! Outbound HTTP plumbing: per-proxy clients, endpoint URLs and request headers.

use axum::http::{header, HeaderMap, HeaderName};
use dashmap::DashMap;
use reqwest::{Client, RequestBuilder};
use std::time::Duration;

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::storage::{Account, Platform};

/// Header carrying the messages-protocol version.
pub const ANTHROPIC_VERSION_HEADER: &str = "anthropic-version";

/// Header carrying opt-in beta feature flags; forwarded as-is.
pub const ANTHROPIC_BETA_HEADER: &str = "anthropic-beta";

/// Console gateways authenticate with this header.
pub const X_API_KEY_HEADER: &str = "x-api-key";

/// Response headers that describe the upstream connection rather than the body.
const HOP_BY_HOP: [HeaderName; 3] = [
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// HTTP clients for upstream calls.
///
/// Accounts without a proxy share one client; each distinct proxy URI gets
/// its own client, built on first use and cached.
pub struct UpstreamClients {
    direct: Client,
    proxied: DashMap<String, Client>,
    timeout: Duration,
    connect_timeout: Duration,
}

impl UpstreamClients {
    pub fn new(relay: &RelayConfig) -> Result<Self> {
        let timeout = relay.http_client_timeout();
        let connect_timeout = relay.connect_timeout();
        let direct = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            direct,
            proxied: DashMap::new(),
            timeout,
            connect_timeout,
        })
    }

    /// Client for `account`, honouring its `proxy_uri`.
    pub fn client_for(&self, account: &Account) -> Result<Client> {
        let Some(uri) = account.proxy_uri.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(self.direct.clone());
        };

        if let Some(client) = self.proxied.get(uri) {
            return Ok(client.clone());
        }

        let proxy = reqwest::Proxy::all(uri).map_err(|e| {
            Error::Directory(format!(
                "account {} has an invalid proxy uri: {}",
                account.id, e
            ))
        })?;
        let client = Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .proxy(proxy)
            .build()?;

        tracing::debug!(account_id = account.id, "Built proxied upstream client");
        self.proxied.insert(uri.to_string(), client.clone());
        Ok(client)
    }
}

/// Full upstream URL for a completion call on `account`.
pub fn endpoint_url(account: &Account, relay: &RelayConfig) -> Result<String> {
    let configured = account
        .request_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty());

    let base = match (account.platform, configured) {
        (_, Some(url)) => url,
        (Platform::Native, None) => relay.native_base_url.as_str(),
        (platform, None) => {
            return Err(Error::Directory(format!(
                "{} account {} has no request_url",
                platform, account.id
            )))
        }
    };
    let base = base.trim_end_matches('/');

    Ok(match account.platform {
        Platform::Native | Platform::Console => format!("{}/v1/messages", base),
        Platform::Foreign => format!("{}/chat/completions", base),
    })
}

/// Build the upstream POST for `account`.
///
/// `client_headers` are the inbound request's headers; only the protocol
/// version and beta flags are carried over. `body` must already be in the
/// account's wire protocol.
pub fn build_request(
    client: &Client,
    account: &Account,
    relay: &RelayConfig,
    client_headers: &HeaderMap,
    body: Vec<u8>,
    stream: bool,
) -> Result<RequestBuilder> {
    let url = endpoint_url(account, relay)?;
    let secret = account.credential.expose_secret();
    let accept = if stream {
        "text/event-stream"
    } else {
        "application/json"
    };

    let mut request = client
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, accept)
        .header(header::AUTHORIZATION, format!("Bearer {}", secret));

    if account.platform == Platform::Foreign {
        return Ok(request.body(body));
    }

    if account.platform == Platform::Console {
        request = request.header(X_API_KEY_HEADER, secret);
    }

    let version = client_headers
        .get(ANTHROPIC_VERSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&relay.anthropic_version);
    request = request.header(ANTHROPIC_VERSION_HEADER, version);

    if let Some(beta) = client_headers.get(ANTHROPIC_BETA_HEADER) {
        request = request.header(ANTHROPIC_BETA_HEADER, beta.clone());
    }

    Ok(request.body(body))
}

/// Upstream response headers minus the hop-by-hop ones axum sets itself.
pub fn copy_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers
}
