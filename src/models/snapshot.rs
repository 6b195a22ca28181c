//! Consumer-facing merged view

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Account, CachedResult, Category, Link};
use crate::budget::CategoryBudget;

/// Whether the stored credentials can still be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    Unknown,
    Valid,
    NeedsReauthentication,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkView {
    pub link: Link,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryView {
    /// Last-known-good data, kept even when the latest fetch failed.
    pub cached: Option<CachedResult>,
    pub budget: Option<CategoryBudget>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountView {
    pub account: Account,
    /// Display name of the institution, once looked up.
    pub institution_name: Option<String>,
    pub categories: BTreeMap<Category, CategoryView>,
}

/// Read-only view of all links and account data at one point in time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub generated_at: Option<DateTime<Utc>>,
    pub auth: AuthState,
    pub links: Vec<LinkView>,
    pub accounts: BTreeMap<String, AccountView>,
    /// Cycle-level failures not tied to a single link or account.
    pub errors: Vec<String>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.accounts.is_empty()
    }

    pub fn link(&self, id: &str) -> Option<&LinkView> {
        self.links.iter().find(|view| view.link.id == id)
    }

    pub fn category(&self, account_id: &str, category: Category) -> Option<&CategoryView> {
        self.accounts
            .get(account_id)
            .and_then(|view| view.categories.get(&category))
    }
}
