//! SQLite-backed [`AccountDirectory`] and [`LogStore`].

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;

use super::directory::{
    Account, AccountDirectory, AccountStatus, ActiveStatus, ApiKeyRecord, DailyCounters,
    HealthUpdate, LogEntry, LogStore, Platform, UsageDelta,
};
use super::logging::{delete_before, format_timestamp};
use crate::config::Credential;
use crate::error::{Error, Result};

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: i64,
    name: String,
    platform: String,
    request_url: Option<String>,
    credential: String,
    proxy_uri: Option<String>,
    group_id: i64,
    priority: i64,
    weight: i64,
    model_mapping: Option<String>,
    today_usage_count: i64,
    today_input_tokens: i64,
    today_output_tokens: i64,
    today_cache_read_input_tokens: i64,
    today_cache_creation_input_tokens: i64,
    today_total_cost: f64,
    active_status: i64,
    current_status: i64,
    rate_limit_end_time: Option<i64>,
}

impl TryFrom<AccountRow> for Account {
    type Error = Error;

    fn try_from(row: AccountRow) -> Result<Self> {
        let platform: Platform = row.platform.parse().map_err(Error::Directory)?;
        let current_status = AccountStatus::from_code(row.current_status).ok_or_else(|| {
            Error::Directory(format!(
                "account {} has unknown status {}",
                row.id, row.current_status
            ))
        })?;

        Ok(Account {
            id: row.id,
            name: row.name,
            platform,
            request_url: row.request_url.filter(|u| !u.is_empty()),
            credential: Credential::from(row.credential),
            proxy_uri: row.proxy_uri.filter(|u| !u.is_empty()),
            group_id: row.group_id,
            priority: row.priority,
            weight: row.weight,
            model_mapping: row.model_mapping.filter(|m| !m.is_empty()),
            today: DailyCounters {
                usage_count: row.today_usage_count,
                input_tokens: row.today_input_tokens,
                output_tokens: row.today_output_tokens,
                cache_read_input_tokens: row.today_cache_read_input_tokens,
                cache_creation_input_tokens: row.today_cache_creation_input_tokens,
                total_cost: row.today_total_cost,
            },
            active_status: ActiveStatus::from_code(row.active_status),
            current_status,
            rate_limit_end_time: row
                .rate_limit_end_time
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ApiKeyRow {
    id: i64,
    name: String,
    group_id: i64,
    model_restriction: Option<String>,
    enabled: bool,
    expires_at: Option<i64>,
    today_usage_count: i64,
    today_input_tokens: i64,
    today_output_tokens: i64,
    today_cache_read_input_tokens: i64,
    today_cache_creation_input_tokens: i64,
    today_total_cost: f64,
}

impl From<ApiKeyRow> for ApiKeyRecord {
    fn from(row: ApiKeyRow) -> Self {
        ApiKeyRecord {
            id: row.id,
            name: row.name,
            group_id: row.group_id,
            model_restriction: row.model_restriction,
            enabled: row.enabled,
            expires_at: row
                .expires_at
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            today: DailyCounters {
                usage_count: row.today_usage_count,
                input_tokens: row.today_input_tokens,
                output_tokens: row.today_output_tokens,
                cache_read_input_tokens: row.today_cache_read_input_tokens,
                cache_creation_input_tokens: row.today_cache_creation_input_tokens,
                total_cost: row.today_total_cost,
            },
        }
    }
}

/// Fields for seeding an account row.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub platform: Platform,
    pub credential: String,
    pub group_id: i64,
    pub request_url: Option<String>,
    pub proxy_uri: Option<String>,
    pub priority: i64,
    pub weight: i64,
    pub model_mapping: Option<String>,
}

impl NewAccount {
    pub fn new(name: &str, platform: Platform, credential: &str, group_id: i64) -> Self {
        Self {
            name: name.to_string(),
            platform,
            credential: credential.to_string(),
            group_id,
            request_url: None,
            proxy_uri: None,
            priority: 100,
            weight: 100,
            model_mapping: None,
        }
    }

    pub fn request_url(mut self, url: &str) -> Self {
        self.request_url = Some(url.to_string());
        self
    }

    pub fn proxy_uri(mut self, uri: &str) -> Self {
        self.proxy_uri = Some(uri.to_string());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn model_mapping(mut self, mapping: &str) -> Self {
        self.model_mapping = Some(mapping.to_string());
        self
    }
}

/// Directory and log store over one SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

const ELIGIBLE_ACCOUNTS_SQL: &str = "SELECT * FROM accounts
    WHERE group_id = ?
      AND active_status = 1
      AND (current_status = 1
           OR (current_status = 3
               AND (rate_limit_end_time IS NULL OR rate_limit_end_time <= ?)))
    ORDER BY priority ASC, today_usage_count ASC, id ASC";

fn rows_to_accounts(rows: Vec<AccountRow>) -> Vec<Account> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id;
            match Account::try_from(row) {
                Ok(account) => Some(account),
                Err(e) => {
                    tracing::warn!(account_id = id, error = %e, "Skipping malformed account row");
                    None
                }
            }
        })
        .collect()
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_account(&self, account: &NewAccount) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO accounts (
                name, platform, request_url, credential, proxy_uri,
                group_id, priority, weight, model_mapping
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.name)
        .bind(account.platform.as_str())
        .bind(&account.request_url)
        .bind(&account.credential)
        .bind(&account.proxy_uri)
        .bind(account.group_id)
        .bind(account.priority)
        .bind(account.weight)
        .bind(&account.model_mapping)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_api_key(
        &self,
        name: &str,
        key: &str,
        group_id: i64,
        model_restriction: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO api_keys (name, key, group_id, model_restriction) VALUES (?, ?, ?, ?)",
        )
        .bind(name)
        .bind(key)
        .bind(group_id)
        .bind(model_restriction)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn set_api_key_expiry(
        &self,
        id: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE api_keys SET expires_at = ? WHERE id = ?")
            .bind(expires_at.map(|t| t.timestamp()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Account::try_from).transpose()
    }

    pub async fn get_api_key(&self, id: i64) -> Result<Option<ApiKeyRecord>> {
        let row: Option<ApiKeyRow> = sqlx::query_as("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ApiKeyRecord::from))
    }

    /// Every account, for operator listings.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as("SELECT * FROM accounts ORDER BY group_id, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows_to_accounts(rows))
    }

    /// Overwrite status fields directly.
    pub async fn set_status(
        &self,
        id: i64,
        status: AccountStatus,
        rate_limit_end_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE accounts SET current_status = ?, rate_limit_end_time = ? WHERE id = ?")
            .bind(status.code())
            .bind(rate_limit_end_time.map(|t| t.timestamp()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_active_status(&self, id: i64, active: ActiveStatus) -> Result<()> {
        sqlx::query("UPDATE accounts SET active_status = ? WHERE id = ?")
            .bind(active.code())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `(outcome, status_code)` of every log row, oldest first.
    pub async fn log_outcomes(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT outcome, status_code FROM logs ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn count_logs(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl AccountDirectory for SqliteStore {
    async fn list_eligible_accounts(
        &self,
        group_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(ELIGIBLE_ACCOUNTS_SQL)
            .bind(group_id)
            .bind(now.timestamp())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows_to_accounts(rows))
    }

    async fn list_accounts_in_status(&self, status: AccountStatus) -> Result<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            "SELECT * FROM accounts WHERE active_status = 1 AND current_status = ? ORDER BY id",
        )
        .bind(status.code())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows_to_accounts(rows))
    }

    async fn increment_usage(&self, account_id: i64, delta: UsageDelta) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET
                today_usage_count = today_usage_count + 1,
                today_input_tokens = today_input_tokens + ?,
                today_output_tokens = today_output_tokens + ?,
                today_cache_read_input_tokens = today_cache_read_input_tokens + ?,
                today_cache_creation_input_tokens = today_cache_creation_input_tokens + ?,
                today_total_cost = today_total_cost + ?,
                last_used_time = ?
            WHERE id = ?",
        )
        .bind(delta.input_tokens)
        .bind(delta.output_tokens)
        .bind(delta.cache_read_input_tokens)
        .bind(delta.cache_creation_input_tokens)
        .bind(delta.cost)
        .bind(format_timestamp(Utc::now()))
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_health(
        &self,
        account_id: i64,
        update: HealthUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = match update {
            HealthUpdate::MarkHealthy => sqlx::query(
                "UPDATE accounts SET current_status = 1, rate_limit_end_time = NULL
                 WHERE id = ?
                   AND (current_status != 3
                        OR rate_limit_end_time IS NULL
                        OR rate_limit_end_time <= ?)",
            )
            .bind(account_id)
            .bind(now.timestamp()),
            HealthUpdate::MarkUpstreamError => sqlx::query(
                "UPDATE accounts SET current_status = 2, rate_limit_end_time = NULL WHERE id = ?",
            )
            .bind(account_id),
            HealthUpdate::MarkRateLimited { until } => sqlx::query(
                "UPDATE accounts SET current_status = 3, rate_limit_end_time = ? WHERE id = ?",
            )
            .bind(until.timestamp())
            .bind(account_id),
        };
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn recover_rate_limited(&self, account_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE accounts SET current_status = 1, rate_limit_end_time = NULL
             WHERE id = ?
               AND current_status = 3
               AND (rate_limit_end_time IS NULL OR rate_limit_end_time <= ?)",
        )
        .bind(account_id)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn recover_upstream_error(&self, account_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE accounts SET current_status = 1, rate_limit_end_time = NULL
             WHERE id = ? AND current_status = 2",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_daily_counters(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut touched = 0;
        for table in ["accounts", "api_keys"] {
            let sql = format!(
                "UPDATE {} SET
                    today_usage_count = 0,
                    today_input_tokens = 0,
                    today_output_tokens = 0,
                    today_cache_read_input_tokens = 0,
                    today_cache_creation_input_tokens = 0,
                    today_total_cost = 0",
                table
            );
            touched += sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(touched)
    }

    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKeyRecord>> {
        let row: Option<ApiKeyRow> = sqlx::query_as("SELECT * FROM api_keys WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ApiKeyRecord::from))
    }

    async fn increment_api_key_usage(&self, api_key_id: i64, delta: UsageDelta) -> Result<()> {
        sqlx::query(
            "UPDATE api_keys SET
                today_usage_count = today_usage_count + 1,
                today_input_tokens = today_input_tokens + ?,
                today_output_tokens = today_output_tokens + ?,
                today_cache_read_input_tokens = today_cache_read_input_tokens + ?,
                today_cache_creation_input_tokens = today_cache_creation_input_tokens + ?,
                today_total_cost = today_total_cost + ?,
                last_used_time = ?
            WHERE id = ?",
        )
        .bind(delta.input_tokens)
        .bind(delta.output_tokens)
        .bind(delta.cache_read_input_tokens)
        .bind(delta.cache_creation_input_tokens)
        .bind(delta.cost)
        .bind(format_timestamp(Utc::now()))
        .bind(api_key_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        entry.insert(&self.pool).await?;
        Ok(())
    }

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(delete_before(&self.pool, cutoff).await?)
    }
}
