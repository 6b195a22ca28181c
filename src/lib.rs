//! Rate-budgeted sync core for bank account data
//!
//! Keeps an authorized session against the bank account data API, tracks
//! bank links through their authorization lifecycle, and lazily fetches
//! balances, details and transactions per account without exceeding the
//! provider's per-account daily quotas. Everything survives restarts through
//! a single persisted state document.

pub mod api;
pub mod auth;
pub mod budget;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod link;
pub mod models;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;

pub use coordinator::{Coordinator, Settings};
pub use error::{SyncError, SyncResult};
