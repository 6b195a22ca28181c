//! Account-related models

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Data category exposed per account, each with its own daily quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Balances,
    Details,
    Transactions,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::Balances,
        Category::Details,
        Category::Transactions,
    ];

    /// Path segment under `/accounts/{id}/`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Balances => "balances",
            Category::Details => "details",
            Category::Transactions => "transactions",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Bank account enumerated from a linked requisition.
///
/// `link_id` is a back-reference only; the link does not own the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub link_id: String,
    pub institution_id: String,
}

/// Latest successful payload for one (account, category).
///
/// The payload is shared so cloning a state document or a snapshot never
/// copies transaction lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub category: Category,
    pub account_id: String,
    pub payload: Arc<serde_json::Value>,
    pub fetched_at: DateTime<Utc>,
}

impl CachedResult {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.fetched_at
    }
}
