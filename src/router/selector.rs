//! Account selection logic.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{Account, AccountDirectory, ApiKeyRecord};

/// Picks the upstream account for a request.
#[derive(Clone)]
pub struct Selector {
    directory: Arc<dyn AccountDirectory>,
}

impl Selector {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self { directory }
    }

    /// Select the preferred selectable account of `group_id` at `now`.
    ///
    /// Lower priority wins, then fewer requests today, then lower id.
    /// Weight is not consulted. `model` is only a hint for the logs: every
    /// account serves every model, foreign ones through their model mapping.
    pub async fn select(&self, group_id: i64, model: &str, now: DateTime<Utc>) -> Result<Account> {
        let candidates = self.directory.list_eligible_accounts(group_id, now).await?;
        let count = candidates.len();

        match pick(candidates, now) {
            Some(account) => {
                tracing::debug!(
                    group_id,
                    model,
                    candidates = count,
                    account_id = account.id,
                    account = %account.name,
                    platform = %account.platform,
                    "Selected account"
                );
                Ok(account)
            }
            None => {
                tracing::warn!(group_id, model, "No available account");
                Err(Error::NoAccountAvailable { group_id })
            }
        }
    }
}

/// Reject a model the API key is not allowed to use.
pub fn check_model_permission(key: &ApiKeyRecord, model: &str) -> Result<()> {
    if key.allows_model(model) {
        Ok(())
    } else {
        Err(Error::ModelNotAllowed {
            model: model.to_string(),
        })
    }
}

/// Choose from candidates without touching storage.
pub fn pick(candidates: Vec<Account>, now: DateTime<Utc>) -> Option<Account> {
    candidates
        .into_iter()
        .filter(|a| a.is_selectable(now))
        .min_by_key(|a| (a.priority, a.today.usage_count, a.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use crate::storage::{AccountStatus, ActiveStatus, DailyCounters, Platform};
    use chrono::Duration;

    fn account(id: i64, priority: i64, usage: i64) -> Account {
        Account {
            id,
            name: format!("acct-{}", id),
            platform: Platform::Native,
            request_url: None,
            credential: Credential::from("k"),
            proxy_uri: None,
            group_id: 1,
            priority,
            weight: 1,
            model_mapping: None,
            today: DailyCounters {
                usage_count: usage,
                ..DailyCounters::default()
            },
            active_status: ActiveStatus::Enabled,
            current_status: AccountStatus::Healthy,
            rate_limit_end_time: None,
        }
    }

    fn key(restriction: Option<&str>) -> ApiKeyRecord {
        ApiKeyRecord {
            id: 1,
            name: "k".into(),
            group_id: 1,
            model_restriction: restriction.map(String::from),
            enabled: true,
            expires_at: None,
            today: DailyCounters::default(),
        }
    }

    #[test]
    fn test_priority_then_usage_then_id() {
        let now = Utc::now();
        let picked = pick(
            vec![account(1, 2, 0), account(2, 1, 9), account(3, 1, 3)],
            now,
        )
        .unwrap();
        assert_eq!(picked.id, 3);

        let picked = pick(vec![account(5, 1, 3), account(4, 1, 3)], now).unwrap();
        assert_eq!(picked.id, 4);
    }

    #[test]
    fn test_weight_does_not_change_choice() {
        let now = Utc::now();
        let light = account(1, 1, 0);
        let mut heavy = account(2, 1, 0);
        heavy.weight = 1000;

        assert_eq!(pick(vec![light.clone(), heavy.clone()], now).unwrap().id, 1);
        heavy.weight = 0;
        assert_eq!(pick(vec![heavy, light], now).unwrap().id, 1);
    }

    #[test]
    fn test_unselectable_filtered() {
        let now = Utc::now();
        let mut limited = account(1, 0, 0);
        limited.current_status = AccountStatus::RateLimited;
        limited.rate_limit_end_time = Some(now + Duration::minutes(5));
        let mut broken = account(2, 0, 0);
        broken.current_status = AccountStatus::UpstreamError;
        let mut disabled = account(3, 0, 0);
        disabled.active_status = ActiveStatus::Disabled;

        assert!(pick(vec![limited.clone(), broken, disabled], now).is_none());

        let ok = account(4, 5, 100);
        assert_eq!(pick(vec![limited.clone(), ok], now).unwrap().id, 4);

        limited.rate_limit_end_time = Some(now - Duration::seconds(1));
        assert_eq!(pick(vec![limited], now).unwrap().id, 1);
    }

    #[test]
    fn test_model_permission() {
        assert!(check_model_permission(&key(None), "claude-opus-4-20250514").is_ok());
        let err = check_model_permission(&key(Some("claude-3-5-haiku-20241022")), "claude-opus-4")
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_model_hint_does_not_filter_accounts() {
        use crate::storage::{init_pool, NewAccount, SqliteStore};

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("select.db");
        let pool = init_pool(path.to_str().unwrap()).await.unwrap();
        let store = Arc::new(SqliteStore::new(pool));
        let id = store
            .insert_account(
                &NewAccount::new("oa", Platform::Foreign, "sk", 1)
                    .request_url("http://localhost/v1")
                    .model_mapping("haiku:gpt-4o-mini"),
            )
            .await
            .unwrap();

        let selector = Selector::new(store);
        let now = Utc::now();
        let account = selector
            .select(1, "claude-opus-4-20250514", now)
            .await
            .unwrap();
        assert_eq!(account.id, id);

        let err = selector
            .select(2, "claude-opus-4-20250514", now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAccountAvailable { group_id: 2 }));
    }
}
