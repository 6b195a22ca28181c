//! Per-account data endpoints (balances, details, transactions)

use super::client::{Endpoint, RemoteClient};
use crate::error::SyncResult;
use crate::models::Category;

impl RemoteClient {
    /// Fetch one category for one account. Spends that (account, category)
    /// quota on the server, so callers reserve budget first.
    pub async fn fetch_account_data(
        &self,
        account_id: &str,
        category: Category,
    ) -> SyncResult<serde_json::Value> {
        tracing::info!("Fetching {} for account {}", category, account_id);
        self.call(&Endpoint::AccountData {
            account_id: account_id.to_string(),
            category,
        })
        .await
    }
}
