//! Background jobs: daily counter reset, log retention, failed-account probes
//! and rate-limit expiry.
//!
//! Each job owns one task and awaits its own run before waiting for the next
//! tick, so a slow run delays the next one instead of overlapping it. A failed
//! run is logged and has no effect for that tick.

use chrono::{DateTime, Months, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::probe::run_probe_cycle;
use super::transition::next_local_time;
use crate::config::Config;
use crate::error::Result;
use crate::proxy::UpstreamClients;
use crate::storage::{AccountDirectory, AccountStatus, LogStore};

/// Local hour at which the daily counters are zeroed.
const DAILY_RESET_HOUR: u32 = 0;

/// Local hour at which old logs are deleted.
const LOG_CLEANUP_HOUR: u32 = 1;

/// Zero the today counters of all accounts and API keys.
pub async fn run_daily_reset(directory: &dyn AccountDirectory) -> Result<u64> {
    let touched = directory.reset_daily_counters().await?;
    tracing::info!(rows = touched, "Daily counters reset");
    Ok(touched)
}

/// Oldest `created_at` kept when retaining `months` of logs.
pub fn retention_cutoff(now: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Delete logs older than `retention_months` before `now`.
pub async fn run_log_cleanup(
    logs: &dyn LogStore,
    retention_months: u32,
    now: DateTime<Utc>,
) -> Result<u64> {
    let cutoff = retention_cutoff(now, retention_months);
    let deleted = logs.delete_logs_before(cutoff).await?;
    tracing::info!(deleted, cutoff = %cutoff, "Old request logs removed");
    Ok(deleted)
}

/// Return every rate-limited account whose limit ended by `now` to healthy.
pub async fn run_rate_limit_recovery(
    directory: &dyn AccountDirectory,
    now: DateTime<Utc>,
) -> Result<usize> {
    let limited = directory
        .list_accounts_in_status(AccountStatus::RateLimited)
        .await?;

    let mut recovered = 0;
    for account in limited {
        let expired = account.rate_limit_end_time.map_or(true, |end| end <= now);
        if !expired {
            continue;
        }
        match directory.recover_rate_limited(account.id, now).await {
            Ok(true) => {
                recovered += 1;
                tracing::info!(account_id = account.id, account = %account.name, "Rate limit lifted");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(account_id = account.id, error = %e, "Failed to lift rate limit");
            }
        }
    }
    Ok(recovered)
}

/// Running background jobs.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn all jobs on the current runtime.
    pub fn start(
        config: Arc<Config>,
        directory: Arc<dyn AccountDirectory>,
        logs: Arc<dyn LogStore>,
        clients: Arc<UpstreamClients>,
    ) -> Self {
        let mut handles = Vec::with_capacity(4);

        let dir = directory.clone();
        handles.push(spawn_daily("daily_reset", DAILY_RESET_HOUR, move || {
            let dir = dir.clone();
            async move { run_daily_reset(dir.as_ref()).await.map(drop) }
        }));

        let retention = config.health.log_retention_months;
        handles.push(spawn_daily("log_cleanup", LOG_CLEANUP_HOUR, move || {
            let logs = logs.clone();
            async move {
                run_log_cleanup(logs.as_ref(), retention, Utc::now())
                    .await
                    .map(drop)
            }
        }));

        let dir = directory.clone();
        let cfg = config.clone();
        handles.push(spawn_interval(
            "account_probe",
            config.health.probe_interval(),
            move || {
                let dir = dir.clone();
                let cfg = cfg.clone();
                let clients = clients.clone();
                async move { run_probe_cycle(dir, &clients, &cfg).await.map(drop) }
            },
        ));

        handles.push(spawn_interval(
            "rate_limit_recovery",
            config.health.rate_limit_check_interval(),
            move || {
                let dir = directory.clone();
                async move { run_rate_limit_recovery(dir.as_ref(), Utc::now()).await.map(drop) }
            },
        ));

        tracing::info!(
            probe_interval_secs = config.health.probe_interval_secs,
            rate_limit_check_interval_secs = config.health.rate_limit_check_interval_secs,
            log_retention_months = retention,
            "Background jobs started"
        );
        Self { handles }
    }

    /// Stop all jobs. A run in progress is cancelled at its next await.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn run_logged<Fut>(name: &'static str, run: Fut)
where
    Fut: Future<Output = Result<()>>,
{
    if let Err(e) = run.await {
        tracing::error!(job = name, error = %e, "Background job failed");
    }
}

fn spawn_interval<F, Fut>(name: &'static str, period: Duration, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; jobs start one period after boot.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_logged(name, job()).await;
        }
    })
}

fn spawn_daily<F, Fut>(name: &'static str, hour: u32, job: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = next_local_time(now, hour);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(job = name, next = %next, "Daily job scheduled");
            tokio::time::sleep(wait).await;
            run_logged(name, job()).await;
        }
    })
}
