//! The domain registry: every fetch funnels through one pipeline.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::domain::DomainSpec;
use crate::bridge::QueryCacheBridge;
use crate::session::Session;
use crate::snapshot::{CacheSnapshot, SnapshotStore};

/// What a single run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
  /// Snapshot inside its freshness window; nothing fetched.
  Fresh,
  /// Another fetch for the same (domain, owner) was already running.
  InFlight,
  /// Fetch succeeded; snapshot and UI cache updated.
  Updated,
  /// Fetch failed; previous snapshot left intact.
  Failed,
}

impl RunOutcome {
  /// Whether the run left new data behind.
  pub fn is_updated(&self) -> bool {
    matches!(self, RunOutcome::Updated)
  }

  /// Whether the run was absorbed without starting a fetch.
  pub fn skipped(&self) -> bool {
    matches!(self, RunOutcome::Fresh | RunOutcome::InFlight)
  }
}

#[derive(Default)]
struct DomainTable {
  specs: BTreeMap<&'static str, Arc<DomainSpec>>,
  sealed: bool,
}

/// Holds every registered domain and runs them on demand.
///
/// All triggers (login, interaction, visibility, timers, realtime) end up in
/// [`DomainRegistry::run`], so the freshness check and the in-flight
/// exclusion hold no matter where a run came from.
pub struct DomainRegistry {
  store: SnapshotStore,
  bridge: QueryCacheBridge,
  domains: Mutex<DomainTable>,
  in_flight: Mutex<HashSet<(String, String)>>,
}

impl DomainRegistry {
  pub fn new(store: SnapshotStore, bridge: QueryCacheBridge) -> Self {
    Self {
      store,
      bridge,
      domains: Mutex::new(DomainTable::default()),
      in_flight: Mutex::new(HashSet::new()),
    }
  }

  fn table(&self) -> MutexGuard<'_, DomainTable> {
    match self.domains.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Register a domain. Fails once the registry is sealed or when the name
  /// is already taken.
  pub fn register(&self, spec: DomainSpec) -> Result<()> {
    let mut table = self.table();
    if table.sealed {
      return Err(eyre!(
        "Registry is sealed; domains must be registered before engine init"
      ));
    }
    if table.specs.contains_key(spec.name) {
      return Err(eyre!("Domain already registered: {}", spec.name));
    }
    debug!(domain = spec.name, scope = ?spec.scope, "domain registered");
    table.specs.insert(spec.name, Arc::new(spec));
    Ok(())
  }

  /// Close registration, so timers and subscriptions never see the domain
  /// set change underneath them.
  pub fn seal(&self) {
    self.table().sealed = true;
  }

  /// Every registered domain, in name order.
  pub fn specs(&self) -> Vec<Arc<DomainSpec>> {
    self.table().specs.values().cloned().collect()
  }

  pub fn spec(&self, name: &str) -> Option<Arc<DomainSpec>> {
    self.table().specs.get(name).cloned()
  }

  /// Run one domain for one owner.
  ///
  /// Unless `force` is set, a snapshot inside its freshness window absorbs
  /// the run without fetching. At most one fetch per (domain, owner) is
  /// ever in flight; a run arriving while one is pending is absorbed as
  /// [`RunOutcome::InFlight`] regardless of `force`.
  ///
  /// `Err` is reserved for unknown domain names; fetch failures come back
  /// as [`RunOutcome::Failed`] with the previous snapshot untouched.
  pub async fn run(&self, domain: &str, owner_key: &str, force: bool) -> Result<RunOutcome> {
    let spec = self
      .spec(domain)
      .ok_or_else(|| eyre!("Unknown sync domain: {}", domain))?;

    if !force && self.store.is_fresh(domain, owner_key, spec.freshness_window) {
      debug!(domain, owner = owner_key, "snapshot fresh, absorbing run");
      return Ok(RunOutcome::Fresh);
    }

    let _guard = match InFlightGuard::acquire(&self.in_flight, domain, owner_key) {
      Some(guard) => guard,
      None => {
        debug!(domain, owner = owner_key, force, "fetch already in flight, absorbing run");
        return Ok(RunOutcome::InFlight);
      }
    };

    debug!(domain, owner = owner_key, force, "fetching");
    match (spec.fetch)(owner_key.to_string()).await {
      Ok(payload) => {
        let snapshot = CacheSnapshot::capture(domain, owner_key, payload);
        self.store.write(&snapshot);
        self.bridge.push(domain, owner_key, snapshot.payload);
        debug!(domain, owner = owner_key, "snapshot updated");
        Ok(RunOutcome::Updated)
      }
      Err(e) => {
        warn!(domain, owner = owner_key, error = %e, "fetch failed, keeping previous snapshot");
        Ok(RunOutcome::Failed)
      }
    }
  }

  /// Run every domain whose scope the session satisfies, concurrently.
  /// Domains the session holds no owner key for are skipped.
  pub async fn run_all(&self, session: &Session, force: bool) -> Vec<(String, RunOutcome)> {
    let mut passes = Vec::new();
    for spec in self.specs() {
      let Some(owner_key) = spec.scope.owner_key(session) else {
        debug!(domain = spec.name, "session lacks scope, skipping");
        continue;
      };
      passes.push(async move {
        let outcome = self
          .run(spec.name, &owner_key, force)
          .await
          .unwrap_or(RunOutcome::Failed);
        (spec.name.to_string(), outcome)
      });
    }

    let results = join_all(passes).await;
    let updated = results.iter().filter(|(_, o)| o.is_updated()).count();
    let failed = results
      .iter()
      .filter(|(_, o)| matches!(o, RunOutcome::Failed))
      .count();
    info!(
      domains = results.len(),
      updated,
      failed,
      forced = force,
      "full pass complete"
    );
    results
  }
}

/// Marks one (domain, owner) fetch as running; the mark clears on drop,
/// including when the owning task is cancelled mid-fetch.
struct InFlightGuard<'a> {
  set: &'a Mutex<HashSet<(String, String)>>,
  key: (String, String),
}

impl<'a> InFlightGuard<'a> {
  fn acquire(
    set: &'a Mutex<HashSet<(String, String)>>,
    domain: &str,
    owner_key: &str,
  ) -> Option<Self> {
    let key = (domain.to_string(), owner_key.to_string());
    let mut in_flight = match set.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    if !in_flight.insert(key.clone()) {
      return None;
    }
    Some(Self { set, key })
  }
}

impl Drop for InFlightGuard<'_> {
  fn drop(&mut self) {
    let mut in_flight = match self.set.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    in_flight.remove(&self.key);
  }
}
