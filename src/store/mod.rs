//! Durable state document
//!
//! Tokens, links, accounts, budget counters and the last-known-good payloads
//! live in one versioned document. The in-memory copy is the source of truth
//! while the process runs; every mutation goes through [`StateStore::update`],
//! which persists before committing so a crash never loses an acknowledged
//! change.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::Institution;
use crate::auth::TokenPair;
use crate::budget::CategoryBudget;
use crate::error::{SyncError, SyncResult};
use crate::models::{Account, CachedResult, Category, Link};

pub const STATE_VERSION: u32 = 1;

/// Budget counters and cached payload for one (account, category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub budget: CategoryBudget,
    pub cached: Option<CachedResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    pub tokens: Option<TokenPair>,
    #[serde(default)]
    pub links: BTreeMap<String, Link>,
    #[serde(default)]
    pub accounts: BTreeMap<String, Account>,
    /// Keyed by account id. Survives account removal so budgets cannot be reset by re-linking.
    #[serde(default)]
    pub categories: BTreeMap<String, BTreeMap<Category, CategoryRecord>>,
    /// Institution metadata looked up once per linked institution.
    #[serde(default)]
    pub institutions: BTreeMap<String, Institution>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            tokens: None,
            links: BTreeMap::new(),
            accounts: BTreeMap::new(),
            categories: BTreeMap::new(),
            institutions: BTreeMap::new(),
        }
    }
}

impl StateDocument {
    pub fn record(&self, account_id: &str, category: Category) -> Option<&CategoryRecord> {
        self.categories
            .get(account_id)
            .and_then(|records| records.get(&category))
    }

    /// Record for the key, created with a fresh window at `ceiling` if missing.
    pub fn record_mut(
        &mut self,
        account_id: &str,
        category: Category,
        ceiling: u32,
        now: DateTime<Utc>,
    ) -> &mut CategoryRecord {
        self.categories
            .entry(account_id.to_string())
            .or_default()
            .entry(category)
            .or_insert_with(|| CategoryRecord {
                budget: CategoryBudget::new(category, ceiling, now),
                cached: None,
            })
    }

    /// Accounts whose owning link is currently Linked.
    pub fn linked_accounts(&self) -> Vec<Account> {
        self.accounts
            .values()
            .filter(|account| {
                self.links
                    .get(&account.link_id)
                    .is_some_and(|link| link.is_linked())
            })
            .cloned()
            .collect()
    }

    /// Drop an account and its cached payloads, keeping its budget counters.
    pub fn remove_account(&mut self, account_id: &str) {
        self.accounts.remove(account_id);
        if let Some(records) = self.categories.get_mut(account_id) {
            for record in records.values_mut() {
                record.cached = None;
            }
        }
    }
}

/// Where the document is persisted.
pub trait StateBackend: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> SyncResult<Option<StateDocument>>;
    fn save(&self, doc: &StateDocument) -> SyncResult<()>;
}

impl<T: StateBackend + ?Sized> StateBackend for Arc<T> {
    fn load(&self) -> SyncResult<Option<StateDocument>> {
        (**self).load()
    }

    fn save(&self, doc: &StateDocument) -> SyncResult<()> {
        (**self).save(doc)
    }
}

/// JSON file written atomically via a sibling temp file.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Move an unreadable document aside so startup can continue.
    fn quarantine(&self) {
        let mut target = self.path.clone().into_os_string();
        target.push(".corrupt");
        if let Err(e) = fs::rename(&self.path, &target) {
            tracing::warn!("Could not move corrupt state file aside: {}", e);
        }
    }
}

impl StateBackend for FileBackend {
    fn load(&self) -> SyncResult<Option<StateDocument>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| SyncError::Storage(format!("failed to read state file: {}", e)))?;

        let doc: StateDocument = match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::error!(
                    "State file {} is unreadable ({}), starting empty",
                    self.path.display(),
                    e
                );
                self.quarantine();
                return Ok(None);
            }
        };

        if doc.version > STATE_VERSION {
            return Err(SyncError::Storage(format!(
                "state file version {} is newer than supported version {}",
                doc.version, STATE_VERSION
            )));
        }

        Ok(Some(doc))
    }

    fn save(&self, doc: &StateDocument) -> SyncResult<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                SyncError::Storage(format!("failed to create state directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| SyncError::Storage(format!("failed to serialize state: {}", e)))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content)
            .map_err(|e| SyncError::Storage(format!("failed to write state file: {}", e)))?;

        // Tokens live in here
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&tmp, perms).map_err(|e| {
                SyncError::Storage(format!("failed to set state permissions: {}", e))
            })?;
        }

        fs::rename(&tmp, &self.path)
            .map_err(|e| SyncError::Storage(format!("failed to replace state file: {}", e)))?;

        Ok(())
    }
}

/// Keeps the last saved document in memory. Used by tests and embedders
/// that persist elsewhere.
#[derive(Default)]
pub struct MemoryBackend {
    saved: Mutex<Option<StateDocument>>,
    saves: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(doc: StateDocument) -> Self {
        Self {
            saved: Mutex::new(Some(doc)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn saved(&self) -> Option<StateDocument> {
        self.saved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> SyncResult<Option<StateDocument>> {
        Ok(self.saved())
    }

    fn save(&self, doc: &StateDocument) -> SyncResult<()> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = Some(doc.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Shared handle over the persisted document.
pub struct StateStore {
    backend: Box<dyn StateBackend>,
    doc: Mutex<StateDocument>,
}

impl StateStore {
    /// Load once at startup. A missing document starts empty.
    pub fn open(backend: impl StateBackend + 'static) -> SyncResult<Self> {
        let doc = backend.load()?.unwrap_or_default();
        tracing::info!(
            "Loaded state: {} links, {} accounts, tokens {}",
            doc.links.len(),
            doc.accounts.len(),
            if doc.tokens.is_some() { "present" } else { "absent" }
        );

        Ok(Self {
            backend: Box::new(backend),
            doc: Mutex::new(doc),
        })
    }

    /// Read a projection of the current document.
    pub fn read<R>(&self, f: impl FnOnce(&StateDocument) -> R) -> R {
        let guard = self.doc.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Apply a mutation, persist it, then commit it in memory.
    ///
    /// If persisting fails the in-memory document is left untouched.
    pub fn update<R>(&self, f: impl FnOnce(&mut StateDocument) -> R) -> SyncResult<R> {
        let mut guard = self.doc.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        let result = f(&mut next);
        if next != *guard {
            self.backend.save(&next)?;
            *guard = next;
        }
        Ok(result)
    }

    pub fn document(&self) -> StateDocument {
        self.read(|doc| doc.clone())
    }
}
