//! Credential vault: owns the token pair and keeps the access token fresh

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use super::tokens::{
    AuthToken, TokenKind, TokenPair, DEFAULT_ACCESS_TTL_SECS, DEFAULT_REFRESH_TTL_SECS,
};
use crate::api::tokens::{request_new_token, request_refresh, TokenResponse};
use crate::api::transport::Transport;
use crate::error::{SyncError, SyncResult};
use crate::models::AuthState;
use crate::store::StateStore;

pub struct CredentialVault {
    transport: Arc<dyn Transport>,
    store: Arc<StateStore>,
    /// Refresh this long before the access token expires.
    margin: Duration,
    timeout: StdDuration,
    /// Serializes refreshes so concurrent fetches share one token round-trip.
    refresh_lock: Mutex<()>,
}

impl CredentialVault {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<StateStore>,
        margin: StdDuration,
        timeout: StdDuration,
    ) -> Self {
        Self {
            transport,
            store,
            margin: Duration::seconds(margin.as_secs() as i64),
            timeout,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Exchange secrets for an initial token pair and persist it.
    pub async fn bootstrap(&self, secret_id: &str, secret_key: &str) -> SyncResult<TokenPair> {
        let _guard = self.refresh_lock.lock().await;
        tracing::info!("Requesting new token pair...");

        let resp = self
            .bounded(request_new_token(
                self.transport.as_ref(),
                secret_id,
                secret_key,
            ))
            .await?;
        let refresh_value = resp.refresh.clone().ok_or_else(|| {
            SyncError::Decode("token response missing 'refresh'".to_string())
        })?;

        let now = Utc::now();
        let pair = TokenPair {
            access: access_token_from(&resp, now),
            refresh: AuthToken::new(
                refresh_value,
                TokenKind::Refresh,
                now,
                resp.refresh_expires.unwrap_or(DEFAULT_REFRESH_TTL_SECS),
            ),
        };

        self.store.update(|doc| doc.tokens = Some(pair.clone()))?;
        tracing::info!(
            "New token pair obtained (access expires: {}, refresh expires: {})",
            pair.access.expires_at,
            pair.refresh.expires_at
        );
        Ok(pair)
    }

    /// A non-expired access token, refreshed first if inside the safety margin.
    pub async fn get_valid_token(&self) -> SyncResult<String> {
        if let Some(token) = self.current_if_valid() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another task may have refreshed while we waited.
        if let Some(token) = self.current_if_valid() {
            return Ok(token);
        }
        self.refresh_stored().await
    }

    /// Refresh after the server rejected `rejected`, unless someone already did.
    pub async fn force_refresh(&self, rejected: &str) -> SyncResult<String> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.current_if_valid() {
            if token != rejected {
                return Ok(token);
            }
        }
        self.refresh_stored().await
    }

    pub fn auth_state(&self) -> AuthState {
        let now = Utc::now();
        self.store.read(|doc| match doc.tokens {
            None => AuthState::NeedsReauthentication,
            Some(ref pair) if pair.refresh.is_expired(now, Duration::zero()) => {
                AuthState::NeedsReauthentication
            }
            Some(_) => AuthState::Valid,
        })
    }

    pub fn tokens(&self) -> Option<TokenPair> {
        self.store.read(|doc| doc.tokens.clone())
    }

    /// Forget stored tokens.
    pub fn clear(&self) -> SyncResult<()> {
        self.store.update(|doc| doc.tokens = None)
    }

    fn current_if_valid(&self) -> Option<String> {
        let now = Utc::now();
        self.store.read(|doc| {
            doc.tokens
                .as_ref()
                .filter(|pair| !pair.access.is_expired(now, self.margin))
                .map(|pair| pair.access.value.clone())
        })
    }

    /// Caller must hold `refresh_lock`.
    async fn refresh_stored(&self) -> SyncResult<String> {
        let now = Utc::now();
        let pair = self.tokens().ok_or(SyncError::AuthExpired)?;
        if pair.refresh.is_expired(now, Duration::zero()) {
            tracing::warn!("Refresh token expired at {}", pair.refresh.expires_at);
            return Err(SyncError::AuthExpired);
        }

        tracing::info!("Refreshing access token...");
        let resp = self
            .bounded(request_refresh(
                self.transport.as_ref(),
                &pair.refresh.value,
            ))
            .await
            .inspect_err(|e| tracing::warn!("Token refresh failed: {}", e))?;

        let now = Utc::now();
        let refresh = match resp.refresh {
            Some(ref value) => AuthToken::new(
                value.clone(),
                TokenKind::Refresh,
                now,
                resp.refresh_expires.unwrap_or(DEFAULT_REFRESH_TTL_SECS),
            ),
            None => pair.refresh,
        };
        let next = TokenPair {
            access: access_token_from(&resp, now),
            refresh,
        };

        // Persist before handing the token out.
        self.store.update(|doc| doc.tokens = Some(next.clone()))?;
        tracing::info!("Access token refreshed (expires: {})", next.access.expires_at);
        Ok(next.access.value)
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| SyncError::Timeout(self.timeout))?
    }
}

fn access_token_from(resp: &TokenResponse, now: chrono::DateTime<Utc>) -> AuthToken {
    AuthToken::new(
        resp.access.clone(),
        TokenKind::Access,
        now,
        resp.access_expires.unwrap_or(DEFAULT_ACCESS_TTL_SECS),
    )
}
