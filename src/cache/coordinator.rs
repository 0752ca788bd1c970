//! Cache coordinator: decides when to trust the local store and when to ask
//! the directory, and keeps memory and the store in step.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::error::{StoreError, SyncError};
use super::storage::LocalStore;
use super::traits::{CacheResult, CacheSource};
use crate::directory::{CustomerDirectory, CustomerDraft, CustomerRecord, DirectoryError};

/// Tunable freshness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
  /// How long after a sync an empty local search is taken as authoritative
  pub trust_window: Duration,
  /// Queries shorter than this (in characters) are not searched
  pub min_query_len: usize,
  /// Age after which the background policy asks for a full resync
  pub resync_after: Duration,
}

impl Default for SyncPolicy {
  fn default() -> Self {
    Self {
      trust_window: Duration::seconds(30),
      min_query_len: 2,
      resync_after: Duration::minutes(60),
    }
  }
}

/// Lifecycle of a cache instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePhase {
  #[default]
  Uninitialized,
  Loading,
  Ready,
  Syncing,
}

/// Outcome of a successful full resync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
  /// Customers now in the working set
  pub customers: usize,
  /// Whether the snapshot reached the local store
  pub persisted: bool,
  pub synced_at: DateTime<Utc>,
}

type SyncFlight = Shared<BoxFuture<'static, Result<SyncReport, SyncError>>>;

#[derive(Debug, Default)]
struct CacheState {
  phase: CachePhase,
  customers: Vec<CustomerRecord>,
  last_sync: Option<DateTime<Utc>>,
  /// False until the store opens; stays false if it never does.
  persistent: bool,
}

struct Inner<D> {
  directory: D,
  store: Arc<dyn LocalStore>,
  policy: SyncPolicy,
  state: Mutex<CacheState>,
  /// The sync currently running, shared by everyone who asks for one.
  sync_slot: Mutex<Option<SyncFlight>>,
}

/// Customer cache shared by everything that shows or searches customers.
///
/// Construct one per session and clone it where needed; clones share state.
pub struct CustomerCache<D: CustomerDirectory> {
  inner: Arc<Inner<D>>,
}

impl<D: CustomerDirectory> Clone for CustomerCache<D> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<D: CustomerDirectory> CustomerCache<D> {
  pub fn new(directory: D, store: Arc<dyn LocalStore>) -> Self {
    Self {
      inner: Arc::new(Inner {
        directory,
        store,
        policy: SyncPolicy::default(),
        state: Mutex::new(CacheState::default()),
        sync_slot: Mutex::new(None),
      }),
    }
  }

  /// Replace the freshness policy. Only meaningful before the cache is shared.
  pub fn with_policy(self, policy: SyncPolicy) -> Self {
    match Arc::try_unwrap(self.inner) {
      Ok(mut inner) => {
        inner.policy = policy;
        Self {
          inner: Arc::new(inner),
        }
      }
      Err(inner) => {
        warn!("Cache already shared; keeping its current policy");
        Self { inner }
      }
    }
  }

  // ==========================================================================
  // Observable state
  // ==========================================================================

  /// Current best-known customer set.
  pub fn customers(&self) -> Vec<CustomerRecord> {
    self.inner.state().customers.clone()
  }

  /// A customer from the working set.
  pub fn customer(&self, id: &str) -> Option<CustomerRecord> {
    self
      .inner
      .state()
      .customers
      .iter()
      .find(|c| c.id == id)
      .cloned()
  }

  pub fn phase(&self) -> CachePhase {
    self.inner.state().phase
  }

  pub fn is_loading(&self) -> bool {
    self.phase() == CachePhase::Loading
  }

  pub fn is_syncing(&self) -> bool {
    self.phase() == CachePhase::Syncing
  }

  pub fn last_sync(&self) -> Option<DateTime<Utc>> {
    self.inner.state().last_sync
  }

  /// Whether the local store opened. False means every search goes remote.
  pub fn is_persistent(&self) -> bool {
    self.inner.state().persistent
  }

  pub fn policy(&self) -> SyncPolicy {
    self.inner.policy
  }

  /// Customers in the local store, if it is open.
  pub fn stored_count(&self) -> Option<usize> {
    self.inner.persist("count", |store| store.count())
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Open the local store and warm memory from it.
  ///
  /// Store failures are not errors: the cache comes up empty and, if the
  /// store is unavailable, stays memory-only for its lifetime.
  pub fn mount(&self) {
    self.inner.mount();
  }

  /// Whether the background policy wants a full resync.
  pub fn needs_sync(&self) -> bool {
    let state = self.inner.state();
    if state.customers.is_empty() {
      return true;
    }
    match state.last_sync {
      Some(at) => Utc::now() - at > self.inner.policy.resync_after,
      None => true,
    }
  }

  /// Run a resync if the policy calls for one. Failures are logged, since the
  /// cached data is still usable. Returns whether a sync succeeded.
  pub async fn ensure_fresh(&self) -> bool {
    if !self.needs_sync() {
      debug!(last_sync = ?self.last_sync(), "Customer cache is fresh");
      return false;
    }
    match self.sync_customers().await {
      Ok(_) => true,
      Err(e) => {
        warn!(error = %e, "Background sync failed; serving cached customers");
        false
      }
    }
  }

  // ==========================================================================
  // Operations
  // ==========================================================================

  /// Replace the cache with the directory's full customer list.
  ///
  /// At most one sync runs at a time: a call made while one is running waits
  /// for it and gets the same outcome. On failure the cached state is left
  /// as it was. The sync runs on its own task, so it lands even if every
  /// caller stops waiting.
  pub async fn sync_customers(&self) -> Result<SyncReport, SyncError> {
    let flight = {
      let mut slot = self.inner.sync_slot();
      match slot.as_ref() {
        Some(flight) => {
          debug!("Sync already in flight; joining it");
          flight.clone()
        }
        None => {
          let flight = self.inner.start_sync();
          *slot = Some(flight.clone());
          flight
        }
      }
    };
    flight.await
  }

  /// Search customers: local store first, the directory only when the local
  /// answer cannot be trusted. Never fails.
  pub async fn search_customers(&self, query: &str) -> CacheResult<Vec<CustomerRecord>> {
    let query = query.trim();
    if query.is_empty() {
      return CacheResult::new(self.customers(), CacheSource::Memory);
    }
    if query.chars().count() < self.inner.policy.min_query_len {
      return CacheResult::new(Vec::new(), CacheSource::Skipped);
    }

    let local = self.inner.search_local(query);
    if !local.is_empty() {
      debug!(query, hits = local.len(), "Answered search locally");
      return CacheResult::new(local, CacheSource::Local);
    }

    if self.inner.within_trust_window() {
      debug!(query, "No local match right after a sync; skipping directory");
      return CacheResult::new(Vec::new(), CacheSource::TrustedEmpty);
    }

    match self.inner.directory.search_customers(query).await {
      Ok(found) => {
        let now = Utc::now();
        let found: Vec<CustomerRecord> = found
          .into_iter()
          .map(|c| c.with_balance_checked_at(now))
          .collect();
        debug!(query, hits = found.len(), "Directory search filled a local miss");
        self.inner.remember(&found);
        CacheResult::new(found, CacheSource::Remote)
      }
      Err(e) => {
        warn!(query, error = %e, "Directory search failed; returning no results");
        CacheResult::new(Vec::new(), CacheSource::Degraded)
      }
    }
  }

  /// Live balance of a customer. Falls back to the cached balance, then to
  /// zero, when the directory cannot be reached. Never fails.
  pub async fn get_customer_balance(&self, id: &str) -> CacheResult<f64> {
    match self.inner.directory.get_customer(id).await {
      Ok(fresh) => {
        let balance = fresh.current_balance.unwrap_or(0.0);
        let stamped = self.inner.persist("update balance", |store| store.update_balance(id, balance));
        let at = stamped.flatten().unwrap_or_else(Utc::now);

        let mut state = self.inner.state();
        if let Some(cached) = state.customers.iter_mut().find(|c| c.id == id) {
          cached.current_balance = Some(balance);
          cached.balance_last_updated = Some(at);
        }
        CacheResult::new(balance, CacheSource::Remote)
      }
      Err(e) => {
        let cached = self.inner.cached(id).and_then(|c| c.current_balance);
        warn!(id, error = %e, cached = ?cached, "Balance fetch failed; using cached balance");
        CacheResult::new(cached.unwrap_or(0.0), CacheSource::Degraded)
      }
    }
  }

  /// Re-fetch one customer and replace the cached copy wholesale.
  /// Failures are logged and the cached copy kept. Never fails.
  pub async fn refresh_customer(&self, id: &str) -> Option<CustomerRecord> {
    match self.inner.directory.get_customer(id).await {
      Ok(fresh) => {
        let fresh = if fresh.current_balance.is_some() {
          fresh.with_balance_checked_at(Utc::now())
        } else {
          fresh
        };
        self.inner.remember(std::slice::from_ref(&fresh));
        Some(fresh)
      }
      Err(e) => {
        warn!(id, error = %e, "Failed to refresh customer; keeping cached copy");
        None
      }
    }
  }

  /// Create a customer on the directory and cache the result.
  pub async fn create_customer(&self, draft: &CustomerDraft) -> Result<CustomerRecord, DirectoryError> {
    let created = self.inner.directory.create_customer(draft).await?;
    info!(id = %created.id, "Customer created");
    self.inner.remember(std::slice::from_ref(&created));
    Ok(created)
  }

  /// Update a customer on the directory and cache the result.
  pub async fn update_customer(
    &self,
    id: &str,
    draft: &CustomerDraft,
  ) -> Result<CustomerRecord, DirectoryError> {
    let updated = self.inner.directory.update_customer(id, draft).await?;
    info!(id = %updated.id, "Customer updated");
    self.inner.remember(std::slice::from_ref(&updated));
    Ok(updated)
  }
}

impl<D: CustomerDirectory> Inner<D> {
  fn state(&self) -> MutexGuard<'_, CacheState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn sync_slot(&self) -> MutexGuard<'_, Option<SyncFlight>> {
    self.sync_slot.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn mount(&self) {
    {
      let mut state = self.state();
      if state.phase != CachePhase::Uninitialized {
        return;
      }
      state.phase = CachePhase::Loading;
    }

    let persistent = match self.store.init() {
      Ok(()) => true,
      Err(StoreError::Unavailable(reason)) => {
        warn!(%reason, "Local store unavailable; cache will be memory-only");
        false
      }
      Err(e) => {
        warn!(error = %e, "Failed to open local store; cache will be memory-only");
        false
      }
    };

    let (customers, last_sync) = if persistent {
      let customers = self.store.get_all().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load cached customers");
        Vec::new()
      });
      let last_sync = self.store.get_last_sync().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to read last sync time");
        None
      });
      (customers, last_sync)
    } else {
      (Vec::new(), None)
    };

    info!(customers = customers.len(), ?last_sync, persistent, "Customer cache loaded");

    let mut state = self.state();
    state.customers = customers;
    state.last_sync = last_sync;
    state.persistent = persistent;
    state.phase = CachePhase::Ready;
  }

  /// Run a store operation if persistence is on. Failures are logged.
  fn persist<T>(
    &self,
    what: &str,
    op: impl FnOnce(&dyn LocalStore) -> Result<T, StoreError>,
  ) -> Option<T> {
    if !self.state().persistent {
      return None;
    }
    match op(self.store.as_ref()) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(operation = what, error = %e, "Local store operation failed");
        None
      }
    }
  }

  fn search_local(&self, query: &str) -> Vec<CustomerRecord> {
    self
      .persist("search", |store| store.search_local(query))
      .unwrap_or_default()
  }

  /// A customer from memory, or from the store when memory lacks it.
  fn cached(&self, id: &str) -> Option<CustomerRecord> {
    let in_memory = self.state().customers.iter().find(|c| c.id == id).cloned();
    in_memory.or_else(|| self.persist("get", |store| store.get_by_id(id)).flatten())
  }

  fn within_trust_window(&self) -> bool {
    let state = self.state();
    match state.last_sync {
      Some(at) => !state.customers.is_empty() && Utc::now() - at < self.policy.trust_window,
      None => false,
    }
  }

  /// Write records through to the store and merge them into memory by id.
  fn remember(&self, records: &[CustomerRecord]) {
    if records.is_empty() {
      return;
    }
    self.persist("upsert", |store| {
      records.iter().try_for_each(|record| store.upsert(record))
    });
    merge_by_id(&mut self.state().customers, records.iter().cloned());
  }

  /// Spawn a sync and return a handle every caller can await.
  ///
  /// Must be called with the sync slot held; the task clears the slot when
  /// it finishes, whatever the outcome.
  fn start_sync(self: &Arc<Self>) -> SyncFlight {
    let inner = Arc::clone(self);
    let task = tokio::spawn(async move {
      let outcome = AssertUnwindSafe(inner.run_sync())
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
          inner.state().phase = CachePhase::Ready;
          Err(SyncError::Aborted("sync task panicked".to_string()))
        });
      inner.sync_slot().take();
      outcome
    });

    task
      .map(|joined| joined.unwrap_or_else(|e| Err(SyncError::Aborted(e.to_string()))))
      .boxed()
      .shared()
  }

  async fn run_sync(&self) -> Result<SyncReport, SyncError> {
    self.mount();
    self.state().phase = CachePhase::Syncing;
    info!("Starting full customer sync");

    let fetched = match self.directory.list_customers().await {
      Ok(fetched) => fetched,
      Err(e) => {
        self.state().phase = CachePhase::Ready;
        warn!(error = %e, "Customer sync failed; keeping cached data");
        return Err(e.into());
      }
    };

    let mut customers = Vec::with_capacity(fetched.len());
    merge_by_id(&mut customers, fetched.into_iter().map(CustomerRecord::without_balance));

    let stored_at = self.persist("store all", |store| store.store_all(&customers));
    let persisted = stored_at.is_some();
    let count = customers.len();

    let synced_at = {
      let mut state = self.state();
      state.customers = customers;
      if let Some(at) = stored_at {
        state.last_sync = Some(state.last_sync.map_or(at, |prev| prev.max(at)));
      }
      state.phase = CachePhase::Ready;
      stored_at.unwrap_or_else(Utc::now)
    };

    info!(customers = count, persisted, "Customer sync complete");
    Ok(SyncReport {
      customers: count,
      persisted,
      synced_at,
    })
  }
}

/// Upsert `incoming` into `target` by id, keeping first-seen positions.
fn merge_by_id(target: &mut Vec<CustomerRecord>, incoming: impl IntoIterator<Item = CustomerRecord>) {
  let mut index: HashMap<String, usize> = target
    .iter()
    .enumerate()
    .map(|(i, c)| (c.id.clone(), i))
    .collect();

  for record in incoming {
    match index.get(&record.id) {
      Some(&i) => target[i] = record,
      None => {
        index.insert(record.id.clone(), target.len());
        target.push(record);
      }
    }
  }
}
