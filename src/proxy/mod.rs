//! HTTP relay module.
//!
//! Accepts messages-protocol requests, relays them to a selected upstream
//! account and queues the accounting that follows.

pub mod bookkeeping;
pub mod dispatcher;
mod handlers;
pub mod rate_limit;
mod server;
pub mod upstream;

pub use bookkeeping::{Bookkeeper, Completion};
pub use handlers::{API_KEY_HEADER, REQUEST_ID_HEADER};
pub use rate_limit::{RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER};
pub use server::{create_router, run_server, AppState};
pub use upstream::UpstreamClients;
