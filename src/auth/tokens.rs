//! Token storage and expiry checks

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Access tokens live a day unless the server says otherwise.
pub const DEFAULT_ACCESS_TTL_SECS: i64 = 86_400;
/// Refresh tokens live 30 days unless the server says otherwise.
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 2_592_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Stored bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub kind: TokenKind,
}

impl AuthToken {
    pub fn new(value: String, kind: TokenKind, issued_at: DateTime<Utc>, ttl_secs: i64) -> Self {
        Self {
            value,
            issued_at,
            expires_at: issued_at + Duration::seconds(ttl_secs),
            kind,
        }
    }

    /// Expired, or will be within `margin` of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin >= self.expires_at
    }
}

/// The persisted unit: replaced wholesale on bootstrap, access half replaced on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: AuthToken,
    pub refresh: AuthToken,
}
