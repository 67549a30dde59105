//! Synthetic requests that tell whether a failed account works again.

use axum::http::HeaderMap;
use serde_json::json;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::proxy::upstream::{build_request, UpstreamClients};
use crate::storage::{Account, AccountDirectory, AccountStatus, Platform};
use crate::transform::canonical::{
    ContentBlock, Message, MessageContent, MessagesRequest, Role, SystemBlock, SystemPrompt,
};
use crate::transform::{map_model, to_chat_request};

/// Prompt sent by every probe.
const PROBE_PROMPT: &str = "hi";

/// System prompt of the CLI clients this relay serves. Some upstreams reject
/// calls that lack it.
const PROBE_SYSTEM: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

/// Metadata user id carried by probe requests.
const PROBE_USER_ID: &str = "20b98a014e3182f9ce654e6c105432083cca392beb1416f6406508b56dc5f";

/// Streaming messages request for `model`, shaped like a real CLI call.
///
/// Only the response status is read; the body is dropped unread.
pub fn probe_request(model: &str) -> MessagesRequest {
    MessagesRequest {
        model: model.to_string(),
        messages: vec![Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::Text {
                text: PROBE_PROMPT.to_string(),
            }]),
        }],
        system: Some(SystemPrompt::Blocks(vec![SystemBlock {
            kind: "text".to_string(),
            text: Some(PROBE_SYSTEM.to_string()),
            cache_control: Some(json!({"type": "ephemeral"})),
        }])),
        max_tokens: Some(1),
        temperature: Some(1.0),
        top_p: None,
        top_k: None,
        stop_sequences: None,
        tools: None,
        tool_choice: None,
        stream: true,
        metadata: Some(json!({"user_id": PROBE_USER_ID})),
    }
}

/// Send one probe through `account`. `Ok(true)` means a 2xx came back.
pub async fn probe_account(
    clients: &UpstreamClients,
    config: &Config,
    account: &Account,
) -> Result<bool> {
    let request = probe_request(&config.health.probe_model);
    let (body, stream) = match account.platform {
        Platform::Native | Platform::Console => (serde_json::to_vec(&request), request.stream),
        Platform::Foreign => {
            let model = map_model(
                &request.model,
                account.model_mapping.as_deref(),
                &config.relay.default_foreign_model,
            );
            let chat = to_chat_request(&request, model);
            (serde_json::to_vec(&chat), chat.stream)
        }
    };
    let body = body.map_err(|e| Error::Internal(format!("failed to encode probe: {}", e)))?;

    let client = clients.client_for(account)?;
    let response = build_request(
        &client,
        account,
        &config.relay,
        &HeaderMap::new(),
        body,
        stream,
    )?
    .timeout(config.health.probe_timeout())
    .send()
    .await?;

    let status = response.status();
    if status.is_success() {
        return Ok(true);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::info!(
        account_id = account.id,
        status = status.as_u16(),
        body = %body,
        "Probe rejected"
    );
    Ok(false)
}

/// Probe every enabled account in upstream-error state once.
///
/// Returns how many accounts went back to healthy.
pub async fn run_probe_cycle(
    directory: Arc<dyn AccountDirectory>,
    clients: &UpstreamClients,
    config: &Config,
) -> Result<usize> {
    let accounts = directory
        .list_accounts_in_status(AccountStatus::UpstreamError)
        .await?;
    if accounts.is_empty() {
        return Ok(0);
    }
    tracing::info!(count = accounts.len(), "Probing accounts in upstream error");

    let mut recovered = 0;
    for account in &accounts {
        match probe_account(clients, config, account).await {
            Ok(true) => match directory.recover_upstream_error(account.id).await {
                Ok(true) => {
                    recovered += 1;
                    tracing::info!(
                        account_id = account.id,
                        account = %account.name,
                        "Account recovered"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(account_id = account.id, error = %e, "Failed to mark account recovered");
                }
            },
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(account_id = account.id, error = %e, "Probe failed");
            }
        }
    }
    Ok(recovered)
}
