//! Account selection.
//!
//! Picks an upstream account for a request based on:
//! - Account health and rate-limit state
//! - Priority and today's usage count
//! - The API key's model allow-list

mod selector;

pub use selector::{check_model_permission, pick, Selector};
