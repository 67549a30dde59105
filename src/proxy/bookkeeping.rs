//! Post-response accounting.
//!
//! Handlers hand a [`Completion`] to the [`Bookkeeper`] and move on. A single
//! worker task prices the usage, bumps the account and API key counters,
//! applies the health transition and appends the request log.
//!
//! Delivery is best effort: jobs still queued when the process dies are lost,
//! a full queue drops new jobs, and a failed directory write is logged and
//! dropped. The response the client already received never depends on any of
//! it.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::pricing::{format_cost, CacheSavings, CostBreakdown, PricingTable};
use crate::storage::{
    AccountDirectory, HealthUpdate, LogEntry, LogStore, RequestOutcome, UsageDelta,
};
use crate::usage::TokenUsage;

/// Everything known about a relayed request once it has finished.
#[derive(Debug, Clone)]
pub struct Completion {
    pub request_id: String,
    pub account_id: Option<i64>,
    pub api_key_id: Option<i64>,
    /// Model the client asked for. Usage reported by the upstream wins for
    /// pricing when present.
    pub model: String,
    pub streaming: bool,
    pub usage: TokenUsage,
    pub status: u16,
    pub outcome: RequestOutcome,
    pub health: Option<HealthUpdate>,
    pub duration_ms: i64,
    pub finished_at: DateTime<Utc>,
}

impl Completion {
    /// Model used for pricing and the log record.
    pub fn billed_model(&self) -> &str {
        if self.usage.model.is_empty() {
            &self.model
        } else {
            &self.usage.model
        }
    }

    /// Counters are only bumped for requests the upstream accepted.
    fn counts_as_usage(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

enum Job {
    Record(Box<Completion>),
    Flush(oneshot::Sender<()>),
}

/// Usage of a completion priced under its billed model.
#[derive(Debug, Clone, PartialEq)]
pub struct Priced {
    pub usage: TokenUsage,
    pub cost: CostBreakdown,
    pub savings: CacheSavings,
}

impl Priced {
    pub fn new(pricing: &PricingTable, completion: &Completion) -> Self {
        let mut usage = completion.usage.clone();
        usage.model = completion.billed_model().to_string();
        Self {
            cost: pricing.cost(&usage),
            savings: pricing.cache_savings(&usage),
            usage,
        }
    }
}

/// Handle to the bookkeeping worker. Cheap to clone.
#[derive(Clone)]
pub struct Bookkeeper {
    tx: mpsc::Sender<Job>,
}

impl Bookkeeper {
    /// Start the worker with room for `capacity` queued jobs. `logs` is `None`
    /// when request logging is disabled.
    pub fn spawn(
        directory: Arc<dyn AccountDirectory>,
        logs: Option<Arc<dyn LogStore>>,
        pricing: Arc<PricingTable>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Worker {
            directory,
            logs,
            pricing,
        };
        let handle = tokio::spawn(worker.run(rx));
        (Self { tx }, handle)
    }

    /// Queue a finished request. Never blocks; drops the job if the queue is
    /// full or the worker is gone.
    pub fn submit(&self, completion: Completion) {
        match self.tx.try_send(Job::Record(Box::new(completion))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Bookkeeping queue full; dropping completion");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Bookkeeping worker stopped; dropping completion");
            }
        }
    }

    /// Wait until every job submitted before this call has been processed.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct Worker {
    directory: Arc<dyn AccountDirectory>,
    logs: Option<Arc<dyn LogStore>>,
    pricing: Arc<PricingTable>,
}

impl Worker {
    async fn run(self, rx: mpsc::Receiver<Job>) {
        let mut jobs = ReceiverStream::new(rx);
        while let Some(job) = jobs.next().await {
            match job {
                Job::Record(completion) => self.record(*completion).await,
                Job::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!("Bookkeeping worker finished");
    }

    async fn record(&self, completion: Completion) {
        let Priced {
            usage,
            cost,
            savings,
        } = Priced::new(&self.pricing, &completion);
        let model = usage.model.clone();
        let delta = UsageDelta::new(&usage, &cost);

        if completion.counts_as_usage() {
            if let Some(account_id) = completion.account_id {
                if let Err(e) = self.directory.increment_usage(account_id, delta).await {
                    tracing::warn!(account_id, error = %e, "Failed to record account usage");
                }
            }
            if let Some(api_key_id) = completion.api_key_id {
                if let Err(e) = self.directory.increment_api_key_usage(api_key_id, delta).await {
                    tracing::warn!(api_key_id, error = %e, "Failed to record API key usage");
                }
            }
        }

        if let (Some(account_id), Some(update)) = (completion.account_id, completion.health) {
            match self
                .directory
                .apply_health(account_id, update, completion.finished_at)
                .await
            {
                Ok(()) => {
                    if update != HealthUpdate::MarkHealthy {
                        tracing::warn!(account_id, ?update, "Account health changed");
                    }
                }
                Err(e) => {
                    tracing::warn!(account_id, error = %e, "Failed to apply health update");
                }
            }
        }

        tracing::info!(
            request_id = %completion.request_id,
            model = %model,
            status = completion.status,
            outcome = completion.outcome.as_str(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cache_read_tokens = usage.cache_read_input_tokens,
            cost = %cost.formatted().total,
            cache_savings = %format_cost(savings.savings),
            cache_savings_percent = %savings.formatted_percent(),
            duration_ms = completion.duration_ms,
            "Request finished"
        );

        let Some(logs) = &self.logs else {
            return;
        };
        let entry = LogEntry {
            request_id: completion.request_id,
            account_id: completion.account_id,
            api_key_id: completion.api_key_id,
            model,
            streaming: completion.streaming,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_input_tokens: usage.cache_read_input_tokens,
            cache_creation_input_tokens: usage.cache_creation_input_tokens,
            total_cost: cost.total,
            duration_ms: completion.duration_ms,
            status_code: completion.status,
            outcome: completion.outcome,
            created_at: completion.finished_at,
        };
        if let Err(e) = logs.append_log(&entry).await {
            tracing::warn!(request_id = %entry.request_id, error = %e, "Failed to write request log");
        }
    }
}
