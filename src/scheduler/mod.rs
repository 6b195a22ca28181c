//! Lazy, jittered fetch scheduling
//!
//! Each cycle the scheduler picks the (account, category) pairs whose cached
//! payload is missing or stale and whose budget still has room, then runs each
//! one as its own task after an independent random delay. Tasks live in a
//! registry keyed by (account, category): a new decision for a key that is
//! still waiting replaces the old task, and a key already talking to the
//! remote is left alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::budget::{RateBudgetTracker, Reservation};
use crate::error::{SyncError, SyncResult};
use crate::models::{Account, CachedResult, Category};
use crate::store::StateStore;

/// Work run for one (account, category) when its delay elapses.
///
/// The last argument is the outcome of the budget re-check: `Ok(())` means a
/// call was reserved, otherwise it carries why the fetch was dropped.
pub type FetchJob =
    Arc<dyn Fn(String, Category, SyncResult<()>) -> BoxFuture<'static, ()> + Send + Sync>;

type Key = (String, Category);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulePolicy {
    pub balances_interval: Duration,
    pub details_interval: Duration,
    pub transactions_interval: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            balances_interval: Duration::from_secs(24 * 3600),
            details_interval: Duration::from_secs(24 * 3600),
            transactions_interval: Duration::from_secs(8 * 3600),
            jitter_min: Duration::from_secs(5),
            jitter_max: Duration::from_secs(40),
        }
    }
}

impl SchedulePolicy {
    pub fn interval(&self, category: Category) -> Duration {
        match category {
            Category::Balances => self.balances_interval,
            Category::Details => self.details_interval,
            Category::Transactions => self.transactions_interval,
        }
    }

    /// Random delay in `[jitter_min, jitter_max]`.
    pub fn jitter(&self) -> Duration {
        let (min, max) = if self.jitter_min <= self.jitter_max {
            (self.jitter_min, self.jitter_max)
        } else {
            (self.jitter_max, self.jitter_min)
        };
        let span_ms = (max - min).as_millis() as u64;
        if span_ms == 0 {
            return min;
        }

        let mut buf = [0u8; 8];
        if let Err(e) = getrandom::getrandom(&mut buf) {
            tracing::warn!("No randomness for fetch jitter ({}), using upper bound", e);
            return max;
        }
        min + Duration::from_millis(u64::from_le_bytes(buf) % (span_ms + 1))
    }
}

/// No cached payload, or one older than the category's refresh interval.
pub fn is_due(cached: Option<&CachedResult>, interval: Duration, now: DateTime<Utc>) -> bool {
    let Some(cached) = cached else {
        return true;
    };
    // A payload stamped in the future is treated as fresh.
    cached
        .age(now)
        .to_std()
        .is_ok_and(|age| age >= interval)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFetch {
    pub account_id: String,
    pub category: Category,
    pub delay: Duration,
}

struct Task {
    generation: u64,
    delay: Duration,
    in_flight: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct Registry {
    tasks: Mutex<HashMap<Key, Task>>,
    /// Number of live tasks, including ones aborted but not yet dropped.
    active: watch::Sender<usize>,
    next_generation: AtomicU64,
}

/// Removes the task's registry entry when its future completes or is dropped.
struct TaskGuard {
    registry: Arc<Registry>,
    key: Key,
    generation: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.registry.tasks.lock() {
            if tasks
                .get(&self.key)
                .is_some_and(|task| task.generation == self.generation)
            {
                tasks.remove(&self.key);
            }
        }
        self.registry
            .active
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

pub struct FetchScheduler {
    tracker: Arc<RateBudgetTracker>,
    store: Arc<StateStore>,
    policy: SchedulePolicy,
    registry: Arc<Registry>,
}

impl FetchScheduler {
    pub fn new(
        tracker: Arc<RateBudgetTracker>,
        store: Arc<StateStore>,
        policy: SchedulePolicy,
    ) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            tracker,
            store,
            policy,
            registry: Arc::new(Registry {
                tasks: Mutex::new(HashMap::new()),
                active,
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Due, budget-permitted fetches for `accounts`, each with its own delay.
    pub fn plan(&self, accounts: &[Account], now: DateTime<Utc>) -> Vec<PlannedFetch> {
        let mut planned = Vec::new();
        for account in accounts {
            for category in Category::ALL {
                let due = self.store.read(|doc| {
                    is_due(
                        doc.record(&account.id, category)
                            .and_then(|record| record.cached.as_ref()),
                        self.policy.interval(category),
                        now,
                    )
                });
                if !due || self.is_in_flight(&account.id, category) {
                    continue;
                }
                if !self.tracker.would_allow(&account.id, category, now) {
                    tracing::debug!("Skipping {}/{}: budget exhausted", account.id, category);
                    continue;
                }
                planned.push(PlannedFetch {
                    account_id: account.id.clone(),
                    category,
                    delay: self.policy.jitter(),
                });
            }
        }
        planned
    }

    /// Spawn one task per planned fetch. Returns how many were spawned.
    pub fn dispatch(&self, planned: Vec<PlannedFetch>, job: FetchJob) -> usize {
        let mut spawned = 0;
        let mut superseded = Vec::new();
        let mut tasks = match self.registry.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };

        for fetch in planned {
            let key = (fetch.account_id.clone(), fetch.category);
            if let Some(existing) = tasks.get(&key) {
                if existing.in_flight.load(Ordering::SeqCst) {
                    tracing::debug!("{}/{} already in flight", key.0, key.1);
                    continue;
                }
                tracing::debug!("Superseding pending fetch for {}/{}", key.0, key.1);
            }

            let generation = self.registry.next_generation.fetch_add(1, Ordering::SeqCst);
            let in_flight = Arc::new(AtomicBool::new(false));
            self.registry.active.send_modify(|count| *count += 1);
            let guard = TaskGuard {
                registry: self.registry.clone(),
                key: key.clone(),
                generation,
            };

            let tracker = self.tracker.clone();
            let job = job.clone();
            let started = in_flight.clone();
            let delay = fetch.delay;
            tracing::debug!(
                "Fetch {}/{} scheduled in {:.1}s",
                fetch.account_id,
                fetch.category,
                delay.as_secs_f64()
            );

            let handle = tokio::spawn(async move {
                let _guard = guard;
                tokio::time::sleep(delay).await;
                started.store(true, Ordering::SeqCst);

                // Budget may have moved while we slept.
                let grant = match tracker.try_reserve(&fetch.account_id, fetch.category) {
                    Ok(Reservation::Allowed { .. }) => Ok(()),
                    Ok(Reservation::Denied { resets_at }) => {
                        tracing::info!(
                            "Dropping fetch {}/{}: budget spent until {}",
                            fetch.account_id,
                            fetch.category,
                            resets_at
                        );
                        Err(SyncError::BudgetExhausted {
                            account_id: fetch.account_id.clone(),
                            category: fetch.category,
                        })
                    }
                    Err(e) => {
                        tracing::error!(
                            "Failed to reserve budget for {}/{}: {}",
                            fetch.account_id,
                            fetch.category,
                            e
                        );
                        Err(e)
                    }
                };
                job(fetch.account_id, fetch.category, grant).await;
            });

            let previous = tasks.insert(
                key,
                Task {
                    generation,
                    delay,
                    in_flight,
                    handle,
                },
            );
            superseded.extend(previous.map(|task| task.handle));
            spawned += 1;
        }
        drop(tasks);

        for handle in superseded {
            handle.abort();
        }
        spawned
    }

    pub fn is_in_flight(&self, account_id: &str, category: Category) -> bool {
        self.registry.tasks.lock().is_ok_and(|tasks| {
            tasks
                .get(&(account_id.to_string(), category))
                .is_some_and(|task| task.in_flight.load(Ordering::SeqCst))
        })
    }

    /// Abort waiting fetches for accounts not in `accounts`. Returns how many were aborted.
    pub fn retain_accounts(&self, accounts: &[Account]) -> usize {
        let mut tasks = match self.registry.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        let stale: Vec<Key> = tasks
            .iter()
            .filter(|((account_id, _), task)| {
                !task.in_flight.load(Ordering::SeqCst)
                    && !accounts.iter().any(|account| &account.id == account_id)
            })
            .map(|(key, _)| key.clone())
            .collect();
        let handles: Vec<JoinHandle<()>> = stale
            .iter()
            .filter_map(|key| tasks.remove(key))
            .map(|task| task.handle)
            .collect();
        drop(tasks);

        for (account_id, category) in &stale {
            tracing::debug!("Cancelling fetch {}/{}: account gone", account_id, category);
        }
        let aborted = handles.len();
        for handle in handles {
            handle.abort();
        }
        aborted
    }

    /// Fetches still waiting on their delay, with the delay they were given.
    pub fn pending_fetches(&self) -> Vec<PlannedFetch> {
        let Ok(tasks) = self.registry.tasks.lock() else {
            return Vec::new();
        };
        let mut pending: Vec<PlannedFetch> = tasks
            .iter()
            .filter(|(_, task)| !task.in_flight.load(Ordering::SeqCst))
            .map(|((account_id, category), task)| PlannedFetch {
                account_id: account_id.clone(),
                category: *category,
                delay: task.delay,
            })
            .collect();
        pending.sort_by(|a, b| (&a.account_id, a.category).cmp(&(&b.account_id, b.category)));
        pending
    }

    /// Resolves once every spawned task has finished or been dropped.
    pub async fn wait_idle(&self) {
        let mut active = self.registry.active.subscribe();
        let _ = active.wait_for(|count| *count == 0).await;
    }

    /// Abort every task. Work already in flight is abandoned.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = match self.registry.tasks.lock() {
            Ok(mut tasks) => tasks.drain().map(|(_, task)| task.handle).collect(),
            Err(_) => return,
        };
        if !handles.is_empty() {
            tracing::info!("Aborting {} scheduled fetches", handles.len());
        }
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for FetchScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
