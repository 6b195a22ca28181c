//! Top-level orchestration of one sync cycle
//!
//! The coordinator owns every component, runs `refresh()` cycles on demand,
//! and publishes a [`Snapshot`] whenever anything observable changes: after a
//! cycle, after a link operation, and after each background fetch lands.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;

use crate::api::{HttpTransport, Institution, RemoteClient, Transport};
use crate::auth::{CredentialVault, TokenPair};
use crate::budget::{BudgetPolicy, RateBudgetTracker};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::link::LinkStateMachine;
use crate::models::{
    AccountView, AuthState, CachedResult, Category, CategoryView, LinkStatus, LinkView, Snapshot,
};
use crate::scheduler::{FetchJob, FetchScheduler, SchedulePolicy};
use crate::store::{FileBackend, StateBackend, StateStore};

/// Runtime knobs, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub redirect_url: String,
    pub request_timeout: Duration,
    pub token_refresh_margin: Duration,
    pub budget: BudgetPolicy,
    pub schedule: SchedulePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redirect_url: "http://localhost:8080/callback".to_string(),
            request_timeout: Duration::from_secs(30),
            token_refresh_margin: Duration::from_secs(60),
            budget: BudgetPolicy::default(),
            schedule: SchedulePolicy::default(),
        }
    }
}

/// Failures recorded against the entity they happened on.
#[derive(Default)]
struct ErrorBook {
    links: HashMap<String, String>,
    fetches: HashMap<(String, Category), String>,
    /// Failures of the cycle itself, reset at the start of each cycle.
    cycle: Vec<String>,
    auth_expired: bool,
}

impl ErrorBook {
    fn note(&mut self, err: &SyncError) {
        if *err == SyncError::AuthExpired {
            self.auth_expired = true;
        }
    }
}

struct Inner {
    store: Arc<StateStore>,
    vault: Arc<CredentialVault>,
    tracker: Arc<RateBudgetTracker>,
    client: Arc<RemoteClient>,
    links: LinkStateMachine,
    errors: Mutex<ErrorBook>,
    snapshot: watch::Sender<Snapshot>,
}

pub struct Coordinator {
    inner: Arc<Inner>,
    scheduler: FetchScheduler,
}

impl Coordinator {
    /// Build from configuration: HTTP transport and the on-disk state file.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        use anyhow::Context;

        let settings = config.settings();
        let transport = HttpTransport::new(&config.api.base_url, settings.request_timeout)
            .context("Failed to build HTTP client")?;
        let state_path = config.state_path()?;
        tracing::debug!("State file: {}", state_path.display());

        Self::with_parts(settings, Arc::new(transport), FileBackend::new(state_path))
            .context("Failed to load sync state")
    }

    /// Load persisted state and publish a snapshot from cache. No remote call.
    pub fn with_parts(
        settings: Settings,
        transport: Arc<dyn Transport>,
        backend: impl StateBackend + 'static,
    ) -> SyncResult<Self> {
        let store = Arc::new(StateStore::open(backend)?);
        let vault = Arc::new(CredentialVault::new(
            transport.clone(),
            store.clone(),
            settings.token_refresh_margin,
            settings.request_timeout,
        ));
        let tracker = Arc::new(RateBudgetTracker::new(store.clone(), settings.budget));
        let client = Arc::new(RemoteClient::new(
            transport,
            vault.clone(),
            tracker.clone(),
            settings.request_timeout,
        ));
        let links = LinkStateMachine::new(client.clone(), store.clone(), settings.redirect_url);
        let scheduler = FetchScheduler::new(tracker.clone(), store.clone(), settings.schedule);

        let (snapshot, _) = watch::channel(Snapshot::default());
        let coordinator = Self {
            inner: Arc::new(Inner {
                store,
                vault,
                tracker,
                client,
                links,
                errors: Mutex::new(ErrorBook::default()),
                snapshot,
            }),
            scheduler,
        };
        coordinator.inner.publish();
        Ok(coordinator)
    }

    /// Run one cycle and return the snapshot as it stands when scheduling is done.
    ///
    /// Fetches dispatched by this cycle land later and republish the snapshot.
    pub async fn refresh(&self) -> Snapshot {
        tracing::info!("Starting refresh cycle");
        self.inner.errors().cycle.clear();

        let listed = match self.inner.client.list_requisitions().await {
            Ok(requisitions) => {
                self.inner.errors().auth_expired = false;
                Some(requisitions)
            }
            Err(e) => {
                tracing::error!("Failed to list requisitions: {}", e);
                let mut errors = self.inner.errors();
                errors.note(&e);
                errors.cycle.push(format!("listing requisitions: {}", e));
                None
            }
        };

        if let Some(requisitions) = listed {
            let mut seen = HashSet::new();
            for requisition in &requisitions {
                seen.insert(requisition.id.clone());
                let result = self.inner.links.observe(requisition);
                self.inner.record_link(&requisition.id, result.map(|_| ()));
            }

            let missing: Vec<String> = self.inner.store.read(|doc| {
                doc.links
                    .values()
                    .filter(|link| !link.status.is_terminal() && !seen.contains(&link.id))
                    .map(|link| link.id.clone())
                    .collect()
            });
            for link_id in missing {
                let result = self.inner.links.poll(&link_id).await;
                self.inner.record_link(&link_id, result.map(|_| ()));
            }

            self.lookup_institutions().await;
        }

        if self.inner.errors().auth_expired {
            tracing::warn!("Credentials need re-authentication, not scheduling fetches");
        } else {
            self.schedule_fetches();
        }

        self.inner.publish()
    }

    /// Last published snapshot. Never blocks on remote work.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Receiver notified on every republish.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Create a link and return the URL the end user must visit.
    pub async fn begin_link(&self, country: &str, institution_id: &str) -> SyncResult<String> {
        let (link, auth_url) = self.inner.links.create(institution_id, country).await?;
        self.inner.errors().links.remove(&link.id);
        self.inner.publish();
        Ok(auth_url)
    }

    /// Called when the end user returns from the bank. Accepts a link id or
    /// the reference handed out in the redirect.
    pub async fn complete_link_callback(&self, id_or_reference: &str) -> SyncResult<LinkStatus> {
        let link_id = self
            .inner
            .links
            .resolve(id_or_reference)
            .ok_or_else(|| SyncError::UnknownLink(id_or_reference.to_string()))?;

        let result = self.inner.links.poll(&link_id).await;
        self.inner
            .record_link(&link_id, result.as_ref().map(|_| ()).map_err(|e| e.clone()));
        let outcome = result?;

        if outcome.status() == LinkStatus::Linked {
            self.schedule_fetches();
        }
        self.inner.publish();
        Ok(outcome.status())
    }

    /// Remove a link remotely and locally. Budgets of its accounts are kept.
    pub async fn unlink(&self, link_id: &str) -> SyncResult<()> {
        let accounts: Vec<String> = self.inner.store.read(|doc| {
            doc.links
                .get(link_id)
                .map(|link| link.account_ids.clone())
                .unwrap_or_default()
        });
        self.inner.links.unlink(link_id).await?;
        let linked = self.inner.store.read(|doc| doc.linked_accounts());
        self.scheduler.retain_accounts(&linked);

        {
            let mut errors = self.inner.errors();
            errors.links.remove(link_id);
            errors
                .fetches
                .retain(|(account_id, _), _| !accounts.contains(account_id));
        }
        self.inner.publish();
        Ok(())
    }

    pub async fn institutions(&self, country: &str) -> SyncResult<Vec<Institution>> {
        self.inner.client.list_institutions(country).await
    }

    /// Exchange long-lived secrets for a fresh token pair.
    pub async fn bootstrap(&self, secret_id: &str, secret_key: &str) -> SyncResult<TokenPair> {
        let pair = self.inner.vault.bootstrap(secret_id, secret_key).await?;
        self.inner.errors().auth_expired = false;
        self.inner.publish();
        Ok(pair)
    }

    /// Forget stored tokens. Links, accounts and cached data stay.
    pub fn logout(&self) -> SyncResult<()> {
        self.inner.vault.clear()?;
        self.inner.publish();
        Ok(())
    }

    pub fn auth_state(&self) -> AuthState {
        self.inner.auth_state()
    }

    pub fn tokens(&self) -> Option<TokenPair> {
        self.inner.vault.tokens()
    }

    pub fn scheduler(&self) -> &FetchScheduler {
        &self.scheduler
    }

    /// Wait for every dispatched fetch to finish.
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Abort pending fetches. Results of abandoned fetches are discarded.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Fetch metadata for linked institutions not looked up yet. Failures retry next cycle.
    async fn lookup_institutions(&self) {
        let missing: BTreeSet<String> = self.inner.store.read(|doc| {
            doc.linked_accounts()
                .into_iter()
                .map(|account| account.institution_id)
                .filter(|id| !id.is_empty() && !doc.institutions.contains_key(id))
                .collect()
        });

        for id in missing {
            let institution = match self.inner.client.get_institution(&id).await {
                Ok(institution) => institution,
                Err(e) => {
                    tracing::warn!("Failed to look up institution {}: {}", id, e);
                    self.inner.errors().note(&e);
                    continue;
                }
            };
            tracing::debug!("Institution {} is {}", id, institution.name);
            let stored = self.inner.store.update(|doc| {
                doc.institutions.insert(id.clone(), institution);
            });
            if let Err(e) = stored {
                tracing::warn!("Failed to store institution {}: {}", id, e);
            }
        }
    }

    fn schedule_fetches(&self) {
        let now = Utc::now();
        let accounts = self.inner.store.read(|doc| doc.linked_accounts());
        let cancelled = self.scheduler.retain_accounts(&accounts);
        if cancelled > 0 {
            tracing::info!("Cancelled {} fetches for accounts no longer linked", cancelled);
        }
        let planned = self.scheduler.plan(&accounts, now);
        if planned.is_empty() {
            tracing::debug!("No fetches due for {} accounts", accounts.len());
            return;
        }

        let inner = self.inner.clone();
        let job: FetchJob = Arc::new(move |account_id: String, category, grant| {
            let inner = inner.clone();
            async move { inner.fetch(account_id, category, grant).await }.boxed()
        });
        let spawned = self.scheduler.dispatch(planned, job);
        tracing::info!("Scheduled {} fetches across {} accounts", spawned, accounts.len());
    }
}

impl Inner {
    fn errors(&self) -> std::sync::MutexGuard<'_, ErrorBook> {
        match self.errors.lock() {
            Ok(errors) => errors,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_link(&self, link_id: &str, result: SyncResult<()>) {
        let mut errors = self.errors();
        match result {
            Ok(()) => {
                errors.links.remove(link_id);
            }
            Err(e) => {
                tracing::warn!("Link {}: {}", link_id, e);
                errors.note(&e);
                errors.links.insert(link_id.to_string(), e.to_string());
            }
        }
    }

    /// Run one scheduled fetch, or record why it was dropped.
    async fn fetch(&self, account_id: String, category: Category, grant: SyncResult<()>) {
        let result = match grant {
            Ok(()) => match self.client.fetch_account_data(&account_id, category).await {
                Ok(payload) => self.store_result(&account_id, category, payload),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        {
            let mut errors = self.errors();
            let key = (account_id.clone(), category);
            match result {
                Ok(()) => {
                    errors.fetches.remove(&key);
                }
                Err(e) => {
                    tracing::error!("Fetch {}/{} failed: {}", account_id, category, e);
                    errors.note(&e);
                    errors.fetches.insert(key, e.to_string());
                }
            }
        }
        self.publish();
    }

    /// Last write wins by `fetched_at`. Results for accounts removed meanwhile are dropped.
    fn store_result(
        &self,
        account_id: &str,
        category: Category,
        payload: serde_json::Value,
    ) -> SyncResult<()> {
        let fetched_at = Utc::now();
        let stored = self.store.update(|doc| {
            if !doc.accounts.contains_key(account_id) {
                return false;
            }
            let Some(record) = doc
                .categories
                .get_mut(account_id)
                .and_then(|records| records.get_mut(&category))
            else {
                return false;
            };
            if record
                .cached
                .as_ref()
                .is_some_and(|cached| cached.fetched_at > fetched_at)
            {
                return false;
            }
            record.cached = Some(CachedResult {
                category,
                account_id: account_id.to_string(),
                payload: Arc::new(payload),
                fetched_at,
            });
            true
        })?;

        if stored {
            tracing::info!("Stored {} for {}", category, account_id);
        } else {
            tracing::debug!("Discarded {} result for {}", category, account_id);
        }
        Ok(())
    }

    fn auth_state(&self) -> AuthState {
        if self.errors().auth_expired {
            return AuthState::NeedsReauthentication;
        }
        self.vault.auth_state()
    }

    fn build_snapshot(&self) -> Snapshot {
        let now = Utc::now();
        let auth = self.auth_state();
        let policy = self.tracker.policy();
        let errors = self.errors();
        self.store.read(|doc| {
            let links = doc
                .links
                .values()
                .map(|link| LinkView {
                    link: link.clone(),
                    error: errors.links.get(&link.id).cloned(),
                })
                .collect();

            let accounts = doc
                .accounts
                .values()
                .map(|account| {
                    let categories = Category::ALL
                        .into_iter()
                        .map(|category| {
                            let record = doc.record(&account.id, category);
                            let view = CategoryView {
                                cached: record.and_then(|record| record.cached.clone()),
                                // Counters as of now, not as last written.
                                budget: record.map(|record| {
                                    record
                                        .budget
                                        .capped(policy.ceiling(category))
                                        .rolled(now)
                                }),
                                error: errors
                                    .fetches
                                    .get(&(account.id.clone(), category))
                                    .cloned(),
                            };
                            (category, view)
                        })
                        .collect();
                    (
                        account.id.clone(),
                        AccountView {
                            account: account.clone(),
                            institution_name: doc
                                .institutions
                                .get(&account.institution_id)
                                .map(|institution| institution.name.clone()),
                            categories,
                        },
                    )
                })
                .collect();

            Snapshot {
                generated_at: Some(now),
                auth,
                links,
                accounts,
                errors: errors.cycle.clone(),
            }
        })
    }

    fn publish(&self) -> Snapshot {
        let snapshot = self.build_snapshot();
        self.snapshot.send_replace(snapshot.clone());
        snapshot
    }
}
