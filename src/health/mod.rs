//! Account health: status changes derived from upstream answers and the
//! background jobs that repair them.

pub mod probe;
pub mod scheduler;
pub mod transition;

pub use probe::{probe_account, run_probe_cycle};
pub use scheduler::{
    retention_cutoff, run_daily_reset, run_log_cleanup, run_rate_limit_recovery, Scheduler,
};
pub use transition::{classify, next_local_midnight, next_local_time, rate_limit_until};
