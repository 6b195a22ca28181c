//! Authenticated client for the bank account data API
//!
//! Wraps a [`Transport`] with token injection, one-shot 401 recovery,
//! rate-limit header reconciliation and status-to-error mapping.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::json;

use super::transport::{ApiRequest, ApiResponse, Transport};
use crate::auth::CredentialVault;
use crate::budget::RateBudgetTracker;
use crate::error::{SyncError, SyncResult};
use crate::models::Category;

/// Remote operations the core performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    ListRequisitions,
    CreateRequisition {
        institution_id: String,
        redirect: String,
        reference: String,
    },
    GetRequisition(String),
    DeleteRequisition(String),
    Institutions {
        country: String,
    },
    Institution(String),
    AccountData {
        account_id: String,
        category: Category,
    },
}

impl Endpoint {
    fn request(&self) -> ApiRequest {
        match self {
            Endpoint::ListRequisitions => ApiRequest::new(Method::GET, "/api/v2/requisitions/"),
            Endpoint::CreateRequisition {
                institution_id,
                redirect,
                reference,
            } => ApiRequest::new(Method::POST, "/api/v2/requisitions/").json(json!({
                "institution_id": institution_id,
                "redirect": redirect,
                "reference": reference,
            })),
            Endpoint::GetRequisition(id) => {
                ApiRequest::new(Method::GET, format!("/api/v2/requisitions/{}/", id))
            }
            Endpoint::DeleteRequisition(id) => {
                ApiRequest::new(Method::DELETE, format!("/api/v2/requisitions/{}/", id))
            }
            Endpoint::Institutions { country } => {
                ApiRequest::new(Method::GET, "/api/v2/institutions/").query("country", country)
            }
            Endpoint::Institution(id) => {
                ApiRequest::new(Method::GET, format!("/api/v2/institutions/{}/", id))
            }
            Endpoint::AccountData {
                account_id,
                category,
            } => ApiRequest::new(
                Method::GET,
                format!("/api/v2/accounts/{}/{}/", account_id, category.as_str()),
            ),
        }
    }

    /// The (account, category) quota this call spends, if any.
    pub fn budget_key(&self) -> Option<(&str, Category)> {
        match self {
            Endpoint::AccountData {
                account_id,
                category,
            } => Some((account_id.as_str(), *category)),
            _ => None,
        }
    }

    fn scope(&self) -> String {
        match self.budget_key() {
            Some((account_id, category)) => format!("{}/{}", account_id, category),
            None => self.request().path,
        }
    }
}

pub struct RemoteClient {
    transport: Arc<dyn Transport>,
    vault: Arc<CredentialVault>,
    tracker: Arc<RateBudgetTracker>,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        vault: Arc<CredentialVault>,
        tracker: Arc<RateBudgetTracker>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            vault,
            tracker,
            timeout,
        }
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    /// Execute an authenticated call and return the decoded JSON body.
    ///
    /// A 401 triggers exactly one forced refresh and one retry.
    pub async fn call(&self, endpoint: &Endpoint) -> SyncResult<serde_json::Value> {
        let mut token = self.vault.get_valid_token().await?;
        let mut retried = false;

        loop {
            let resp = self.send_once(endpoint, &token).await?;
            self.observe_limits(endpoint, &resp);

            match resp.status {
                401 if !retried => {
                    tracing::info!("401 for {}, refreshing token and retrying", endpoint.scope());
                    retried = true;
                    token = self.vault.force_refresh(&token).await?;
                }
                401 => {
                    tracing::error!("Second 401 for {}, giving up", endpoint.scope());
                    return Err(SyncError::AuthExpired);
                }
                429 => {
                    if let Some((account_id, category)) = endpoint.budget_key() {
                        if let Err(e) = self.tracker.force_denied(account_id, category) {
                            tracing::error!("Failed to record 429 for {}: {}", account_id, e);
                        }
                    }
                    return Err(SyncError::RateLimited {
                        scope: endpoint.scope(),
                    });
                }
                status if !resp.is_success() => {
                    return Err(SyncError::RemoteError {
                        status,
                        body: resp.body,
                    });
                }
                _ => return resp.json(),
            }
        }
    }

    async fn send_once(&self, endpoint: &Endpoint, token: &str) -> SyncResult<ApiResponse> {
        let request = endpoint.request().bearer(token);
        tracing::debug!("{} {}", request.method, request.path);

        tokio::time::timeout(self.timeout, self.transport.send(request))
            .await
            .map_err(|_| SyncError::Timeout(self.timeout))?
    }

    fn observe_limits(&self, endpoint: &Endpoint, resp: &ApiResponse) {
        let limits = resp.rate_limits();
        if let (Some(limit), Some(remaining)) = (limits.general_limit, limits.general_remaining) {
            tracing::debug!(
                "General rate limit for {}: {}/{} remaining",
                endpoint.scope(),
                remaining,
                limit
            );
        }

        let (Some((account_id, category)), Some((limit, remaining))) =
            (endpoint.budget_key(), limits.account())
        else {
            return;
        };
        if let Err(e) = self.tracker.observe(account_id, category, limit, remaining) {
            tracing::error!("Failed to record rate limit for {}: {}", account_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetPolicy;
    use crate::store::{StateDocument, StateStore, MemoryBackend};
    use crate::testing::{stale_tokens, valid_tokens, Reply, ScriptedTransport};
    use crate::auth::TokenPair;

    const BALANCES: &str = "/api/v2/accounts/acc-1/balances/";

    fn client_with(transport: Arc<ScriptedTransport>, tokens: TokenPair) -> RemoteClient {
        let store = Arc::new(
            StateStore::open(MemoryBackend::with_document(StateDocument {
                tokens: Some(tokens),
                ..Default::default()
            }))
            .unwrap(),
        );
        let vault = Arc::new(CredentialVault::new(
            transport.clone(),
            store.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let tracker = Arc::new(RateBudgetTracker::new(store, BudgetPolicy::default()));
        RemoteClient::new(transport, vault, tracker, Duration::from_secs(5))
    }

    fn balances() -> Endpoint {
        Endpoint::AccountData {
            account_id: "acc-1".into(),
            category: Category::Balances,
        }
    }

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let transport = ScriptedTransport::new();
        transport.on(Method::GET, BALANCES, |req, _| {
            assert_eq!(req.bearer.as_deref(), Some("access-1"));
            Reply::json(200, json!({"balances": []}))
        });
        let client = client_with(transport.clone(), valid_tokens());

        assert_eq!(client.call(&balances()).await.unwrap(), json!({"balances": []}));
    }

    #[tokio::test]
    async fn test_429_forces_denied_for_rest_of_window() {
        let transport = ScriptedTransport::new();
        transport.on(Method::GET, BALANCES, |_, _| Reply::status(429, "slow down"));
        let client = client_with(transport.clone(), valid_tokens());
        assert!(client.tracker.would_allow("acc-1", Category::Balances, chrono::Utc::now()));

        let err = client.call(&balances()).await.unwrap_err();

        assert!(matches!(err, SyncError::RateLimited { .. }));
        assert!(!client.tracker.try_reserve("acc-1", Category::Balances).unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_401_refreshes_once_and_retries() {
        let transport = ScriptedTransport::new();
        transport.on(Method::GET, BALANCES, |req, hit| match hit {
            0 => Reply::status(401, "expired"),
            _ => {
                assert_eq!(req.bearer.as_deref(), Some("access-2"));
                Reply::json(200, json!({"ok": true}))
            }
        });
        transport.on(Method::POST, "/api/v2/token/refresh/", |_, _| {
            Reply::json(200, json!({"access": "access-2", "access_expires": 86400}))
        });
        let client = client_with(transport.clone(), valid_tokens());

        assert_eq!(client.call(&balances()).await.unwrap(), json!({"ok": true}));
        assert_eq!(transport.calls_to("/api/v2/token/refresh/"), 1);
        assert_eq!(transport.calls_to(BALANCES), 2);
    }

    #[tokio::test]
    async fn test_second_401_is_fatal() {
        let transport = ScriptedTransport::new();
        transport.on(Method::GET, BALANCES, |_, _| Reply::status(401, "nope"));
        transport.on(Method::POST, "/api/v2/token/refresh/", |_, _| {
            Reply::json(200, json!({"access": "access-2"}))
        });
        let client = client_with(transport.clone(), valid_tokens());

        assert_eq!(client.call(&balances()).await, Err(SyncError::AuthExpired));
        assert_eq!(transport.calls_to(BALANCES), 2);
    }

    #[tokio::test]
    async fn test_other_errors_map_to_remote_error() {
        let transport = ScriptedTransport::new();
        transport.on(Method::GET, BALANCES, |_, _| Reply::status(503, "maintenance"));
        let client = client_with(transport, valid_tokens());

        assert_eq!(
            client.call(&balances()).await,
            Err(SyncError::RemoteError {
                status: 503,
                body: "maintenance".into()
            })
        );
    }

    #[tokio::test]
    async fn test_rate_limit_headers_reconcile_budget_even_on_failure() {
        let transport = ScriptedTransport::new();
        transport.on(Method::GET, "/api/v2/accounts/acc-1/transactions/", |_, _| {
            Reply::status(500, "boom")
                .with_header("X-RateLimit-Account-Success-Limit", "4")
                .with_header("X-RateLimit-Account-Success-Remaining", "1")
        });
        let client = client_with(transport, valid_tokens());

        let endpoint = Endpoint::AccountData {
            account_id: "acc-1".into(),
            category: Category::Transactions,
        };
        assert!(client.call(&endpoint).await.is_err());

        // Ceiling 3, server says 1 left: 2 already spent.
        let budget = client.tracker.budget("acc-1", Category::Transactions).unwrap();
        assert_eq!((budget.used, budget.limit), (2, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_request_times_out() {
        let transport = ScriptedTransport::new();
        transport.on(Method::GET, BALANCES, |_, _| Reply::Hang);
        let client = client_with(transport, valid_tokens());

        assert_eq!(
            client.call(&balances()).await,
            Err(SyncError::Timeout(Duration::from_secs(5)))
        );
    }

    #[tokio::test]
    async fn test_stale_token_refreshed_before_call() {
        let transport = ScriptedTransport::new();
        transport.on(Method::POST, "/api/v2/token/refresh/", |_, _| {
            Reply::json(200, json!({"access": "access-2"}))
        });
        transport.on(Method::GET, "/api/v2/requisitions/", |req, _| {
            assert_eq!(req.bearer.as_deref(), Some("access-2"));
            Reply::json(200, json!({"results": []}))
        });
        let client = client_with(transport.clone(), stale_tokens());

        client.call(&Endpoint::ListRequisitions).await.unwrap();
        assert_eq!(transport.call_count(), 2);
    }
}
