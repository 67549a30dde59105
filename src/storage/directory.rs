//! The account directory seam: the records the relay reads and the atomic
//! updates it is allowed to issue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::config::Credential;
use crate::error::Result;
use crate::pricing::CostBreakdown;
use crate::usage::TokenUsage;

pub use super::logging::{LogEntry, RequestOutcome};

/// Upstream protocol family of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Platform {
    /// Messages protocol with a first-party credential.
    Native,
    /// Messages protocol behind a console-style gateway.
    Console,
    /// Chat-completions protocol; requests and responses are translated.
    Foreign,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Native => "claude",
            Platform::Console => "claude_console",
            Platform::Foreign => "openai",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Platform::Native),
            "claude_console" => Ok(Platform::Console),
            "openai" => Ok(Platform::Foreign),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActiveStatus {
    Enabled,
    Disabled,
}

impl ActiveStatus {
    pub fn code(self) -> i64 {
        match self {
            ActiveStatus::Enabled => 1,
            ActiveStatus::Disabled => 2,
        }
    }

    pub fn from_code(code: i64) -> Self {
        if code == 1 {
            ActiveStatus::Enabled
        } else {
            ActiveStatus::Disabled
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccountStatus {
    Healthy,
    UpstreamError,
    RateLimited,
}

impl AccountStatus {
    pub fn code(self) -> i64 {
        match self {
            AccountStatus::Healthy => 1,
            AccountStatus::UpstreamError => 2,
            AccountStatus::RateLimited => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(AccountStatus::Healthy),
            2 => Some(AccountStatus::UpstreamError),
            3 => Some(AccountStatus::RateLimited),
            _ => None,
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountStatus::Healthy => "healthy",
            AccountStatus::UpstreamError => "upstream_error",
            AccountStatus::RateLimited => "rate_limited",
        };
        f.write_str(s)
    }
}

/// Running daily totals, shared by accounts and API keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DailyCounters {
    pub usage_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    pub request_url: Option<String>,
    pub credential: Credential,
    pub proxy_uri: Option<String>,
    pub group_id: i64,
    pub priority: i64,
    /// Stored for operators; selection does not consult it.
    pub weight: i64,
    pub model_mapping: Option<String>,
    pub today: DailyCounters,
    pub active_status: ActiveStatus,
    pub current_status: AccountStatus,
    pub rate_limit_end_time: Option<DateTime<Utc>>,
}

impl Account {
    /// Whether the selector may hand this account out at `now`.
    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        if self.active_status != ActiveStatus::Enabled {
            return false;
        }
        match self.current_status {
            AccountStatus::Healthy => true,
            AccountStatus::RateLimited => self.rate_limit_end_time.map_or(true, |end| end <= now),
            AccountStatus::UpstreamError => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub name: String,
    pub group_id: i64,
    /// Comma-separated allow-list; empty or absent allows every model.
    pub model_restriction: Option<String>,
    pub enabled: bool,
    /// Keys past this instant are rejected as unknown.
    pub expires_at: Option<DateTime<Utc>>,
    pub today: DailyCounters,
}

impl ApiKeyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Case-insensitive check against the allow-list.
    pub fn allows_model(&self, model: &str) -> bool {
        let Some(restriction) = self.model_restriction.as_deref() else {
            return true;
        };
        let mut allowed = restriction
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .peekable();
        if allowed.peek().is_none() {
            return true;
        }
        allowed.any(|m| m.eq_ignore_ascii_case(model))
    }
}

/// One request's contribution to the daily counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageDelta {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cost: f64,
}

impl UsageDelta {
    pub fn new(usage: &TokenUsage, cost: &CostBreakdown) -> Self {
        Self {
            input_tokens: usage.input_tokens as i64,
            output_tokens: usage.output_tokens as i64,
            cache_read_input_tokens: usage.cache_read_input_tokens as i64,
            cache_creation_input_tokens: usage.cache_creation_input_tokens as i64,
            cost: cost.total,
        }
    }
}

/// Status change derived from an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthUpdate {
    /// Back to healthy. Does not override a rate limit that is still running.
    MarkHealthy,
    MarkUpstreamError,
    MarkRateLimited { until: DateTime<Utc> },
}

/// Read access to accounts and API keys plus the atomic updates the relay
/// and its background jobs perform. Every method maps to one statement.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Enabled accounts of `group_id` that are healthy or whose rate limit
    /// expired by `now`, ordered by priority, then today's usage count, then id.
    async fn list_eligible_accounts(
        &self,
        group_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>>;

    /// Enabled accounts currently in `status`.
    async fn list_accounts_in_status(&self, status: AccountStatus) -> Result<Vec<Account>>;

    async fn increment_usage(&self, account_id: i64, delta: UsageDelta) -> Result<()>;

    async fn apply_health(
        &self,
        account_id: i64,
        update: HealthUpdate,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Rate limited → healthy if the limit ended by `now`. Returns whether
    /// the row changed.
    async fn recover_rate_limited(&self, account_id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Upstream error → healthy. Returns whether the row changed.
    async fn recover_upstream_error(&self, account_id: i64) -> Result<bool>;

    /// Zero the daily counters of every account and API key. Returns the
    /// number of rows touched.
    async fn reset_daily_counters(&self) -> Result<u64>;

    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>>;

    async fn increment_api_key_usage(&self, api_key_id: i64, delta: UsageDelta) -> Result<()>;
}

/// Append-only request log.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_log(&self, entry: &LogEntry) -> Result<()>;

    /// Delete entries created before `cutoff`; returns how many were removed.
    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
