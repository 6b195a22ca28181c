//! Error taxonomy for the sync core

use std::time::Duration;

use thiserror::Error;

use crate::models::Category;

/// Failures surfaced by the sync core.
///
/// Every variant is attached to the entity it occurred on (a link, an
/// account category, or the token pair) and never aborts a refresh cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Access token rejected and the refresh token is gone or expired.
    #[error("authentication expired, re-authentication required")]
    AuthExpired,

    #[error("credentials rejected: {0}")]
    InvalidCredentials(String),

    /// The server answered 429. `scope` is `account/category` or the request path.
    #[error("rate limited by server for {scope}")]
    RateLimited { scope: String },

    /// Local budget for the current window is spent. No request was made.
    #[error("daily budget exhausted for {account_id}/{category}")]
    BudgetExhausted {
        account_id: String,
        category: Category,
    },

    #[error("transient link error: {0}")]
    TransientLinkError(String),

    #[error("remote error (HTTP {status}): {body}")]
    RemoteError { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("unknown remote status code '{0}'")]
    UnknownStatus(String),

    #[error("unknown link '{0}'")]
    UnknownLink(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// Whether the failure is worth retrying on the next natural cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::TransientLinkError(_)
                | SyncError::Timeout(_)
                | SyncError::Transport(_)
                | SyncError::RemoteError { status: 500..=599, .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(SyncError::RemoteError {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!SyncError::RemoteError {
            status: 404,
            body: String::new()
        }
        .is_transient());
        assert!(!SyncError::AuthExpired.is_transient());
    }
}
