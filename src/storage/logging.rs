//! Request log records and their database operations.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

/// How a relayed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed,
    /// The client went away before the response finished.
    Aborted,
    /// The upstream answered with a non-2xx status.
    UpstreamError,
    NetworkError,
    Timeout,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Completed => "completed",
            RequestOutcome::Aborted => "aborted",
            RequestOutcome::UpstreamError => "upstream_error",
            RequestOutcome::NetworkError => "network_error",
            RequestOutcome::Timeout => "timeout",
        }
    }
}

/// A finished request, ready for insertion.
///
/// All fields are owned so the entry can move into the bookkeeping task.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub request_id: String,
    pub account_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub model: String,
    pub streaming: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub total_cost: f64,
    pub duration_ms: i64,
    pub status_code: u16,
    pub outcome: RequestOutcome,
    pub created_at: DateTime<Utc>,
}

/// Timestamps are stored as fixed-width RFC 3339 text so that string order
/// matches time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl LogEntry {
    /// Insert this log entry into the database.
    pub async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO logs (
                request_id, account_id, api_key_id, model, streaming,
                input_tokens, output_tokens, cache_read_input_tokens,
                cache_creation_input_tokens, total_cost, duration_ms,
                status_code, outcome, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.request_id)
        .bind(self.account_id)
        .bind(self.api_key_id)
        .bind(&self.model)
        .bind(self.streaming)
        .bind(self.input_tokens as i64)
        .bind(self.output_tokens as i64)
        .bind(self.cache_read_input_tokens as i64)
        .bind(self.cache_creation_input_tokens as i64)
        .bind(self.total_cost)
        .bind(self.duration_ms)
        .bind(self.status_code as i64)
        .bind(self.outcome.as_str())
        .bind(format_timestamp(self.created_at))
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Delete log rows created before `cutoff`.
pub async fn delete_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM logs WHERE created_at < ?")
        .bind(format_timestamp(cutoff))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
