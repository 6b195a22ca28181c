//! Authentication for the bank account data API
//!
//! Long-lived secrets are exchanged for an access/refresh token pair, which
//! the vault keeps fresh and persists after every change.

pub mod tokens;
pub mod vault;

pub use tokens::{AuthToken, TokenKind, TokenPair};
pub use vault::CredentialVault;

/// Long-lived API secrets issued in the provider's dashboard.
#[derive(Clone)]
pub struct Credentials {
    pub secret_id: String,
    pub secret_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}
