//! Per (account, category) daily request budgets
//!
//! Each budget is a small record with a rolling 24h window. All transitions are
//! pure functions of `(record, now)`; [`RateBudgetTracker`] applies them to the
//! persisted document so counters survive restarts.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::models::Category;
use crate::store::StateStore;

/// Length of one budget window.
pub const WINDOW_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryBudget {
    pub category: Category,
    pub window_start: DateTime<Utc>,
    pub used: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Allowed { remaining: u32 },
    Denied { resets_at: DateTime<Utc> },
}

impl Reservation {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Reservation::Allowed { .. })
    }
}

impl CategoryBudget {
    pub fn new(category: Category, limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            category,
            window_start: now,
            used: 0,
            limit,
        }
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        self.window_start + Duration::seconds(WINDOW_SECS)
    }

    /// Start a new window once a full one has elapsed. The limit carries over.
    pub fn rolled(self, now: DateTime<Utc>) -> Self {
        if now >= self.resets_at() {
            Self {
                window_start: now,
                used: 0,
                ..self
            }
        } else {
            self
        }
    }

    /// Never let a stored limit exceed the configured ceiling.
    pub fn capped(self, ceiling: u32) -> Self {
        let limit = self.limit.min(ceiling);
        Self {
            limit,
            used: self.used.min(limit),
            ..self
        }
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    pub fn reserve(self, now: DateTime<Utc>) -> (Self, Reservation) {
        let budget = self.rolled(now);
        if budget.used < budget.limit {
            let next = Self {
                used: budget.used + 1,
                ..budget
            };
            (
                next,
                Reservation::Allowed {
                    remaining: next.remaining(),
                },
            )
        } else {
            (
                budget,
                Reservation::Denied {
                    resets_at: budget.resets_at(),
                },
            )
        }
    }

    /// Reconcile with server-reported counters.
    ///
    /// The server only ever corrects `used` upward; a lower remaining count
    /// than we expect means another session spent budget we never saw.
    pub fn observe(
        self,
        ceiling: u32,
        server_limit: u32,
        server_remaining: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let budget = self.rolled(now);
        let limit = ceiling.min(server_limit);
        let server_used = limit.saturating_sub(server_remaining);
        Self {
            limit,
            used: budget.used.max(server_used).min(limit),
            ..budget
        }
    }

    /// Spend the remainder of the window.
    pub fn exhausted(self, now: DateTime<Utc>) -> Self {
        let budget = self.rolled(now);
        Self {
            used: budget.limit,
            ..budget
        }
    }
}

/// Configured ceilings, kept below the documented remote limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetPolicy {
    pub balances_per_day: u32,
    pub details_per_day: u32,
    pub transactions_per_day: u32,
    /// Fraction of the documented limit we allow ourselves to spend.
    pub safety_factor: f64,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            balances_per_day: 2,
            details_per_day: 2,
            transactions_per_day: 4,
            safety_factor: 0.75,
        }
    }
}

impl BudgetPolicy {
    pub fn documented(&self, category: Category) -> u32 {
        match category {
            Category::Balances => self.balances_per_day,
            Category::Details => self.details_per_day,
            Category::Transactions => self.transactions_per_day,
        }
    }

    /// floor(documented * safety_factor), but at least one call when the
    /// documented limit allows any.
    pub fn ceiling(&self, category: Category) -> u32 {
        let documented = self.documented(category);
        if documented == 0 {
            return 0;
        }
        let scaled = (documented as f64 * self.safety_factor.clamp(0.0, 1.0)).floor() as u32;
        scaled.max(1)
    }
}

/// Applies budget transitions to the persisted state.
pub struct RateBudgetTracker {
    store: Arc<StateStore>,
    policy: BudgetPolicy,
}

impl RateBudgetTracker {
    pub fn new(store: Arc<StateStore>, policy: BudgetPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    pub fn try_reserve(&self, account_id: &str, category: Category) -> SyncResult<Reservation> {
        self.try_reserve_at(account_id, category, Utc::now())
    }

    pub fn try_reserve_at(
        &self,
        account_id: &str,
        category: Category,
        now: DateTime<Utc>,
    ) -> SyncResult<Reservation> {
        let ceiling = self.policy.ceiling(category);
        let decision = self.store.update(|doc| {
            let record = doc.record_mut(account_id, category, ceiling, now);
            let (next, decision) = record.budget.capped(ceiling).reserve(now);
            record.budget = next;
            decision
        })?;

        match decision {
            Reservation::Allowed { remaining } => tracing::debug!(
                "Reserved {} call for {} ({} left in window)",
                category,
                account_id,
                remaining
            ),
            Reservation::Denied { resets_at } => tracing::info!(
                "Budget exhausted for {}/{} until {}",
                account_id,
                category,
                resets_at
            ),
        }

        Ok(decision)
    }

    /// Whether `try_reserve` would currently succeed. Does not mutate state.
    pub fn would_allow(&self, account_id: &str, category: Category, now: DateTime<Utc>) -> bool {
        let ceiling = self.policy.ceiling(category);
        self.store.read(|doc| {
            let budget = doc
                .record(account_id, category)
                .map(|record| record.budget)
                .unwrap_or_else(|| CategoryBudget::new(category, ceiling, now))
                .capped(ceiling)
                .rolled(now);
            budget.used < budget.limit
        })
    }

    pub fn observe(
        &self,
        account_id: &str,
        category: Category,
        server_limit: u32,
        server_remaining: u32,
    ) -> SyncResult<()> {
        let now = Utc::now();
        let ceiling = self.policy.ceiling(category);
        let budget = self.store.update(|doc| {
            let record = doc.record_mut(account_id, category, ceiling, now);
            record.budget = record
                .budget
                .observe(ceiling, server_limit, server_remaining, now);
            record.budget
        })?;

        tracing::info!(
            "Account rate limit for {}/{}: {}/{} remaining (server), local {}/{}",
            account_id,
            category,
            server_remaining,
            server_limit,
            budget.used,
            budget.limit
        );
        if server_limit < 50 && server_remaining <= 1 {
            tracing::warn!(
                "Low rate limit: only {} requests remaining for {}/{} (limit: {})",
                server_remaining,
                account_id,
                category,
                server_limit
            );
        }
        Ok(())
    }

    /// Server ground truth (429) overrides the local counter for the rest of the window.
    pub fn force_denied(&self, account_id: &str, category: Category) -> SyncResult<()> {
        let now = Utc::now();
        let ceiling = self.policy.ceiling(category);
        self.store.update(|doc| {
            let record = doc.record_mut(account_id, category, ceiling, now);
            record.budget = record.budget.capped(ceiling).exhausted(now);
        })?;
        tracing::warn!(
            "Server rate limited {}/{}, denying until window resets",
            account_id,
            category
        );
        Ok(())
    }

    pub fn budget(&self, account_id: &str, category: Category) -> Option<CategoryBudget> {
        self.store
            .read(|doc| doc.record(account_id, category).map(|record| record.budget))
    }
}
