//! The engine facade: one object the host drives.
//!
//! Hosts construct the engine with their storage, cache, and realtime
//! collaborators, register a domain catalog, then forward four lifecycle
//! moments: login (`init`), sign-out (`teardown`), the first user
//! interaction, and visibility regain. Everything else (timers, realtime
//! subscriptions, debounce) runs behind the facade.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::bridge::{QueryCacheBridge, ReactiveCache};
use crate::config::SyncConfig;
use crate::realtime::{RealtimeChannel, RealtimeInvalidator};
use crate::session::Session;
use crate::snapshot::{KeyValueStorage, SnapshotStore, SqliteStorage};
use crate::sync::{DomainRegistry, DomainSpec};
use crate::triggers::{DeviceProfile, Trigger, TriggerCoordinator};

pub struct SyncEngine {
  config: SyncConfig,
  device: DeviceProfile,
  store: SnapshotStore,
  bridge: QueryCacheBridge,
  registry: Arc<DomainRegistry>,
  coordinator: Arc<TriggerCoordinator>,
  invalidator: Arc<RealtimeInvalidator>,
  session: Mutex<Option<Session>>,
  interaction_seen: AtomicBool,
}

impl SyncEngine {
  pub fn new(
    config: SyncConfig,
    device: DeviceProfile,
    storage: Arc<dyn KeyValueStorage>,
    cache: Arc<dyn ReactiveCache>,
    channel: Arc<dyn RealtimeChannel>,
  ) -> Self {
    let store = SnapshotStore::new(storage);
    let bridge = QueryCacheBridge::new(cache);
    let registry = Arc::new(DomainRegistry::new(store.clone(), bridge.clone()));
    let invalidator = Arc::new(RealtimeInvalidator::new(channel, registry.clone()));
    let coordinator = Arc::new(TriggerCoordinator::new(
      config.clone(),
      device,
      registry.clone(),
      invalidator.clone(),
    ));

    Self {
      config,
      device,
      store,
      bridge,
      registry,
      coordinator,
      invalidator,
      session: Mutex::new(None),
      interaction_seen: AtomicBool::new(false),
    }
  }

  /// Engine backed by the on-disk snapshot database named in the config.
  pub fn with_sqlite(
    config: SyncConfig,
    device: DeviceProfile,
    cache: Arc<dyn ReactiveCache>,
    channel: Arc<dyn RealtimeChannel>,
  ) -> Result<Self> {
    let storage: Arc<dyn KeyValueStorage> = match &config.storage_path {
      Some(path) => Arc::new(SqliteStorage::open_at(path)?),
      None => Arc::new(SqliteStorage::open()?),
    };
    Ok(Self::new(config, device, storage, cache, channel))
  }

  /// Register a domain. Registration closes at `init`.
  pub fn register(&self, spec: DomainSpec) -> Result<()> {
    self.registry.register(spec)
  }

  pub fn register_all(&self, specs: Vec<DomainSpec>) -> Result<()> {
    for spec in specs {
      self.registry.register(spec)?;
    }
    Ok(())
  }

  fn session_slot(&self) -> MutexGuard<'_, Option<Session>> {
    match self.session.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// The active session, if any.
  pub fn session(&self) -> Option<Session> {
    self.session_slot().clone()
  }

  /// Coordinator access for hosts that relay their own triggers.
  pub fn coordinator(&self) -> &Arc<TriggerCoordinator> {
    &self.coordinator
  }

  /// Live realtime subscription count, for host diagnostics.
  pub fn active_subscriptions(&self) -> usize {
    self.invalidator.active_subscriptions()
  }

  /// Adopt a session: hydrate the UI cache from persisted snapshots, open
  /// realtime subscriptions, start the timers, and run the login pass.
  ///
  /// Hydration is synchronous and happens before any fetch starts, so a
  /// cold start paints from disk first. On a constrained device the login
  /// pass is deferred to an idle window instead of running inline.
  ///
  /// Calling `init` while a session is active tears the old one down first.
  pub async fn init(&self, session: Session) {
    if self.session().is_some() {
      info!("init while a session is active, tearing down first");
      self.teardown();
    }

    info!(
      user = %session.user_id,
      org = session.org_id.as_deref().unwrap_or("-"),
      "engine init"
    );
    self.registry.seal();
    *self.session_slot() = Some(session.clone());

    let hydrated = self.hydrate(&session);
    debug!(hydrated, "ui cache hydrated from snapshots");

    self.invalidator.start(&session);
    self.coordinator.start(&session);

    self.pass_or_defer(Trigger::Login).await;
  }

  /// Run a full pass now, or after the idle-defer delay on constrained
  /// devices so background fetches stay off the interactive path.
  async fn pass_or_defer(&self, trigger: Trigger) {
    if self.device.is_constrained() {
      let defer = self.config.idle_defer();
      info!(
        %trigger,
        defer_ms = defer.as_millis() as u64,
        "constrained device, deferring pass to idle"
      );
      let coordinator = self.coordinator.clone();
      tokio::spawn(async move {
        tokio::time::sleep(defer).await;
        coordinator.full_pass(trigger).await;
      });
    } else {
      self.coordinator.full_pass(trigger).await;
    }
  }

  /// Push every persisted snapshot the session can own into the UI cache.
  fn hydrate(&self, session: &Session) -> usize {
    let mut hydrated = 0;
    for spec in self.registry.specs() {
      let Some(owner_key) = spec.scope.owner_key(session) else {
        continue;
      };
      if let Some(snapshot) = self.store.read(spec.name, &owner_key) {
        self.bridge.push(spec.name, &owner_key, snapshot.payload);
        hydrated += 1;
      }
    }
    hydrated
  }

  /// Sign out: stop the timers, drop every subscription, and purge every
  /// persisted snapshot so nothing leaks into the next session.
  pub fn teardown(&self) {
    self.coordinator.stop();
    self.invalidator.stop();
    self.store.purge_all();
    self.bridge.reset();
    *self.session_slot() = None;
    info!("engine torn down, snapshots purged");
  }

  /// First meaningful user interaction after startup. Later calls no-op.
  /// On constrained devices the warmup pass is deferred to an idle window
  /// like the login pass, never run inline with the interaction.
  pub async fn notify_first_interaction(&self) {
    if self.interaction_seen.swap(true, Ordering::SeqCst) {
      return;
    }
    debug!("first interaction, warming caches");
    self.pass_or_defer(Trigger::FirstInteraction).await;
  }

  /// The app returned to the foreground.
  pub async fn notify_visibility_regained(&self) {
    self.coordinator.full_pass(Trigger::VisibilityRegained).await;
  }

  /// Apply an optimistic local patch to one domain's cache entry.
  ///
  /// The mutator receives the current snapshot payload (or `Value::Null`
  /// without one) and returns the payload to show. Only the UI cache is
  /// touched; the persisted snapshot stays authoritative, so the next
  /// fetch reconciles the entry with the server state.
  pub fn apply_local_patch<F>(&self, domain: &str, mutate: F) -> Result<()>
  where
    F: FnOnce(Value) -> Value,
  {
    let session = self.session().ok_or_else(|| eyre!("No active session"))?;
    let spec = self
      .registry
      .spec(domain)
      .ok_or_else(|| eyre!("Unknown sync domain: {}", domain))?;
    let owner_key = spec.scope.owner_key(&session).ok_or_else(|| {
      eyre!(
        "Session lacks the {:?} scope for domain {}",
        spec.scope,
        domain
      )
    })?;

    let current = self
      .store
      .read(domain, &owner_key)
      .map(|snapshot| snapshot.payload)
      .unwrap_or(Value::Null);
    let patched = mutate(current);

    debug!(domain, owner = %owner_key, "local patch applied ahead of reconciliation");
    self.bridge.push(domain, &owner_key, patched);
    Ok(())
  }
}
