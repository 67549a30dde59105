//! ccrelay - pooled-account relay for the messages API
//!
//! Accepts messages-protocol requests, picks a healthy upstream account from
//! the key's group, and relays the call. Chat-completions accounts are served
//! through request, response and stream translation. Token usage is read off
//! the response as it streams by, priced, and booked in the background.

pub mod config;
pub mod error;
pub mod health;
pub mod pricing;
pub mod proxy;
pub mod router;
pub mod sse;
pub mod storage;
pub mod transform;
pub mod usage;

pub use config::Config;
pub use error::{Error, Result};
