//! Data models for linked institutions, accounts and fetched data

mod account;
mod link;
mod snapshot;

pub use account::*;
pub use link::*;
pub use snapshot::*;
