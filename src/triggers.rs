//! Trigger coordination: when synchronization actually happens.
//!
//! Domains never run spontaneously. Every run traces back to a trigger:
//! login, the first user interaction, the app regaining visibility, a
//! per-domain timer, or a realtime change notification. The coordinator
//! owns the timers and the debounce that keeps burst triggers from turning
//! into burst fetches.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::realtime::RealtimeInvalidator;
use crate::session::Session;
use crate::sync::{DomainRegistry, RunOutcome};

/// Why a run or pass started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
  /// Login completed; the session is usable.
  Login,
  /// First meaningful user interaction after startup. Fired once.
  FirstInteraction,
  /// The app returned to the foreground.
  VisibilityRegained,
  /// A per-domain periodic timer fired.
  Timer { domain: String },
  /// A change notification arrived for a table the domain watches.
  Realtime { domain: String },
}

impl Trigger {
  /// Whether runs for this trigger bypass the freshness window.
  ///
  /// Only the first-interaction warmup trusts fresh snapshots; everything
  /// else indicates the world may have moved and forces a refetch.
  pub fn forces(&self) -> bool {
    !matches!(self, Trigger::FirstInteraction)
  }
}

impl fmt::Display for Trigger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Trigger::Login => write!(f, "login"),
      Trigger::FirstInteraction => write!(f, "first-interaction"),
      Trigger::VisibilityRegained => write!(f, "visibility-regain"),
      Trigger::Timer { domain } => write!(f, "timer:{}", domain),
      Trigger::Realtime { domain } => write!(f, "realtime:{}", domain),
    }
  }
}

/// Host device and network characteristics that shape scheduling.
///
/// Constrained profiles get the longer debounce and a deferred login pass,
/// keeping first paint and metered connections out of harm's way.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceProfile {
  /// Touch-first device without a precise pointer.
  pub coarse_pointer: bool,
  /// The user asked for reduced data usage.
  pub save_data: bool,
  /// Connection reported as 2G-class.
  pub slow_connection: bool,
}

impl DeviceProfile {
  pub fn is_constrained(&self) -> bool {
    self.coarse_pointer || self.save_data || self.slow_connection
  }
}

#[derive(Default)]
struct CoordinatorState {
  session: Option<Session>,
  last_pass: Option<Instant>,
  timers: Vec<JoinHandle<()>>,
}

/// Runs full passes on demand and keeps the per-domain timers alive.
pub struct TriggerCoordinator {
  config: SyncConfig,
  device: DeviceProfile,
  registry: Arc<DomainRegistry>,
  invalidator: Arc<RealtimeInvalidator>,
  state: Mutex<CoordinatorState>,
}

impl TriggerCoordinator {
  pub fn new(
    config: SyncConfig,
    device: DeviceProfile,
    registry: Arc<DomainRegistry>,
    invalidator: Arc<RealtimeInvalidator>,
  ) -> Self {
    Self {
      config,
      device,
      registry,
      invalidator,
      state: Mutex::new(CoordinatorState::default()),
    }
  }

  fn state(&self) -> MutexGuard<'_, CoordinatorState> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Adopt a session and spawn the per-domain refresh timers.
  ///
  /// The first tick of every timer lands one full interval out; the login
  /// pass covers the present.
  pub fn start(&self, session: &Session) {
    let mut state = self.state();
    Self::stop_locked(&mut state);
    state.session = Some(session.clone());

    for spec in self.registry.specs() {
      let Some(owner_key) = spec.scope.owner_key(session) else {
        continue;
      };
      let interval = spec.refresh_interval;
      if interval.is_zero() {
        debug!(domain = spec.name, "periodic refresh disabled");
        continue;
      }

      let registry = self.registry.clone();
      let name = spec.name;
      let trigger = Trigger::Timer {
        domain: name.to_string(),
      };
      let handle = tokio::spawn(async move {
        let first_tick = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(first_tick, interval);
        loop {
          ticker.tick().await;
          debug!(trigger = %trigger, "periodic refresh");
          if let Err(e) = registry.run(name, &owner_key, true).await {
            warn!(domain = name, error = %e, "periodic refresh failed");
          }
        }
      });
      state.timers.push(handle);
    }

    info!(
      timers = state.timers.len(),
      constrained = self.device.is_constrained(),
      "trigger coordination started"
    );
  }

  /// Abort the timers and forget the session.
  pub fn stop(&self) {
    let mut state = self.state();
    Self::stop_locked(&mut state);
  }

  fn stop_locked(state: &mut CoordinatorState) {
    for handle in state.timers.drain(..) {
      handle.abort();
    }
    state.session = None;
    state.last_pass = None;
  }

  /// Live timer tasks.
  pub fn timer_count(&self) -> usize {
    let mut state = self.state();
    state.timers.retain(|handle| !handle.is_finished());
    state.timers.len()
  }

  /// Run a debounced full pass over every domain the session can own.
  ///
  /// A pass landing inside the debounce window of the previous one is
  /// dropped, not queued; the suppressed trigger's work is covered by the
  /// pass that just ran. Returns the per-domain outcomes, empty when the
  /// pass was dropped or no session is active.
  pub async fn full_pass(&self, trigger: Trigger) -> Vec<(String, RunOutcome)> {
    // Subscriptions that failed to open get another chance on every trigger,
    // including ones whose pass is debounced away below.
    self.invalidator.ensure_subscribed();

    let session = {
      let mut state = self.state();
      let Some(session) = state.session.clone() else {
        debug!(%trigger, "no active session, ignoring trigger");
        return Vec::new();
      };

      let debounce = self.config.debounce(self.device.is_constrained());
      if let Some(last) = state.last_pass {
        if last.elapsed() < debounce {
          debug!(
            %trigger,
            elapsed_ms = last.elapsed().as_millis() as u64,
            "full pass debounced, dropping"
          );
          return Vec::new();
        }
      }
      state.last_pass = Some(Instant::now());
      session
    };

    info!(%trigger, forced = trigger.forces(), "full pass starting");
    self.registry.run_all(&session, trigger.forces()).await
  }

  /// Run a single domain outside the debounce, e.g. for a host relaying its
  /// own push notifications.
  pub async fn run_domain(&self, domain: &str, trigger: Trigger) -> Option<RunOutcome> {
    let session = self.state().session.clone()?;
    let spec = self.registry.spec(domain)?;
    let owner_key = spec.scope.owner_key(&session)?;

    debug!(%trigger, domain, "single-domain run");
    match self.registry.run(domain, &owner_key, trigger.forces()).await {
      Ok(outcome) => Some(outcome),
      Err(e) => {
        warn!(domain, error = %e, "single-domain run failed");
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bridge::{MemoryCache, QueryCacheBridge};
  use crate::realtime::MemoryRealtimeHub;
  use crate::snapshot::{MemoryStorage, SnapshotStore};
  use crate::sync::{DomainSpec, OwnerScope};
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn coordinator_for(spec: DomainSpec, config: SyncConfig, device: DeviceProfile) -> TriggerCoordinator {
    let store = SnapshotStore::new(Arc::new(MemoryStorage::new()));
    let bridge = QueryCacheBridge::new(Arc::new(MemoryCache::new()));
    let registry = Arc::new(DomainRegistry::new(store, bridge));
    registry.register(spec).unwrap();
    let invalidator = Arc::new(RealtimeInvalidator::new(
      Arc::new(MemoryRealtimeHub::new()),
      registry.clone(),
    ));
    TriggerCoordinator::new(config, device, registry, invalidator)
  }

  fn counting_spec(counter: Arc<AtomicUsize>, window: Duration) -> DomainSpec {
    DomainSpec::new("jobs", OwnerScope::User, move |_owner| {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!([]))
      }
    })
    .with_freshness_window(window)
    .with_refresh_interval(Duration::ZERO)
  }

  #[tokio::test]
  async fn test_login_pass_runs_domains() {
    let counter = Arc::new(AtomicUsize::new(0));
    let coordinator = coordinator_for(
      counting_spec(counter.clone(), Duration::from_secs(180)),
      SyncConfig::default(),
      DeviceProfile::default(),
    );

    coordinator.start(&Session::user("u1"));
    let results = coordinator.full_pass(Trigger::Login).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0], ("jobs".to_string(), RunOutcome::Updated));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_rapid_passes_collapse_into_one() {
    let counter = Arc::new(AtomicUsize::new(0));
    let coordinator = coordinator_for(
      counting_spec(counter.clone(), Duration::ZERO),
      SyncConfig::default(),
      DeviceProfile::default(),
    );

    coordinator.start(&Session::user("u1"));
    let first = coordinator.full_pass(Trigger::Login).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let second = coordinator.full_pass(Trigger::VisibilityRegained).await;

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_pass_after_debounce_window_runs() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = SyncConfig {
      debounce_ms: 50,
      ..SyncConfig::default()
    };
    let coordinator = coordinator_for(
      counting_spec(counter.clone(), Duration::ZERO),
      config,
      DeviceProfile::default(),
    );

    coordinator.start(&Session::user("u1"));
    coordinator.full_pass(Trigger::Login).await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    coordinator.full_pass(Trigger::VisibilityRegained).await;

    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_constrained_device_debounces_longer() {
    let config = SyncConfig {
      debounce_ms: 0,
      constrained_debounce_ms: 10_000,
      ..SyncConfig::default()
    };

    let relaxed_counter = Arc::new(AtomicUsize::new(0));
    let relaxed = coordinator_for(
      counting_spec(relaxed_counter.clone(), Duration::ZERO),
      config.clone(),
      DeviceProfile::default(),
    );
    relaxed.start(&Session::user("u1"));
    relaxed.full_pass(Trigger::Login).await;
    relaxed.full_pass(Trigger::VisibilityRegained).await;
    assert_eq!(relaxed_counter.load(Ordering::SeqCst), 2);

    let constrained_counter = Arc::new(AtomicUsize::new(0));
    let constrained = coordinator_for(
      counting_spec(constrained_counter.clone(), Duration::ZERO),
      config,
      DeviceProfile {
        save_data: true,
        ..DeviceProfile::default()
      },
    );
    constrained.start(&Session::user("u1"));
    constrained.full_pass(Trigger::Login).await;
    constrained.full_pass(Trigger::VisibilityRegained).await;
    assert_eq!(constrained_counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_first_interaction_trusts_fresh_snapshots() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = SyncConfig {
      debounce_ms: 30,
      ..SyncConfig::default()
    };
    let coordinator = coordinator_for(
      counting_spec(counter.clone(), Duration::from_secs(3_600)),
      config,
      DeviceProfile::default(),
    );

    coordinator.start(&Session::user("u1"));
    coordinator.full_pass(Trigger::Login).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let results = coordinator.full_pass(Trigger::FirstInteraction).await;

    assert_eq!(results[0].1, RunOutcome::Fresh);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_visibility_regain_forces_refetch() {
    let counter = Arc::new(AtomicUsize::new(0));
    let config = SyncConfig {
      debounce_ms: 30,
      ..SyncConfig::default()
    };
    let coordinator = coordinator_for(
      counting_spec(counter.clone(), Duration::from_secs(3_600)),
      config,
      DeviceProfile::default(),
    );

    coordinator.start(&Session::user("u1"));
    coordinator.full_pass(Trigger::Login).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let results = coordinator.full_pass(Trigger::VisibilityRegained).await;

    // Snapshot is well inside its window; visibility still refetches.
    assert_eq!(results[0].1, RunOutcome::Updated);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_timer_refreshes_periodically() {
    let counter = Arc::new(AtomicUsize::new(0));
    let spec = counting_spec(counter.clone(), Duration::from_secs(3_600))
      .with_refresh_interval(Duration::from_millis(40));
    let coordinator = coordinator_for(spec, SyncConfig::default(), DeviceProfile::default());

    coordinator.start(&Session::user("u1"));
    assert_eq!(coordinator.timer_count(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let after_run = counter.load(Ordering::SeqCst);
    assert!(after_run >= 2, "expected periodic refreshes, got {}", after_run);

    coordinator.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), after_run);
    assert_eq!(coordinator.timer_count(), 0);
  }

  #[tokio::test]
  async fn test_zero_interval_disables_timer() {
    let counter = Arc::new(AtomicUsize::new(0));
    let coordinator = coordinator_for(
      counting_spec(counter.clone(), Duration::from_secs(3_600)),
      SyncConfig::default(),
      DeviceProfile::default(),
    );

    coordinator.start(&Session::user("u1"));
    assert_eq!(coordinator.timer_count(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_host_relayed_trigger_runs_one_domain() {
    let counter = Arc::new(AtomicUsize::new(0));
    let coordinator = coordinator_for(
      counting_spec(counter.clone(), Duration::from_secs(3_600)),
      SyncConfig::default(),
      DeviceProfile::default(),
    );

    coordinator.start(&Session::user("u1"));
    let outcome = coordinator
      .run_domain(
        "jobs",
        Trigger::Realtime {
          domain: "jobs".to_string(),
        },
      )
      .await;

    assert_eq!(outcome, Some(RunOutcome::Updated));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_debounced_pass_still_recovers_subscriptions() {
    use crate::realtime::{ChangeFeed, OwnerFilter, RealtimeChannel};
    use crate::sync::TableWatch;
    use color_eyre::eyre::eyre;
    use color_eyre::Result;

    struct FlakyChannel {
      hub: MemoryRealtimeHub,
      failures_left: AtomicUsize,
    }

    impl RealtimeChannel for FlakyChannel {
      fn subscribe(&self, table: &str, filter: &OwnerFilter) -> Result<ChangeFeed> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
          self.failures_left.store(left - 1, Ordering::SeqCst);
          return Err(eyre!("websocket not ready"));
        }
        self.hub.subscribe(table, filter)
      }
    }

    const WATCHES: &[TableWatch] = &[TableWatch {
      table: "applications",
      owner_column: "seeker_id",
    }];

    let store = SnapshotStore::new(Arc::new(MemoryStorage::new()));
    let bridge = QueryCacheBridge::new(Arc::new(MemoryCache::new()));
    let registry = Arc::new(DomainRegistry::new(store, bridge));
    let counter = Arc::new(AtomicUsize::new(0));
    registry
      .register(counting_spec(counter, Duration::ZERO).with_watches(WATCHES))
      .unwrap();

    // Fails at start and on the first pass; succeeds from then on.
    let channel = Arc::new(FlakyChannel {
      hub: MemoryRealtimeHub::new(),
      failures_left: AtomicUsize::new(2),
    });
    let invalidator = Arc::new(RealtimeInvalidator::new(channel, registry.clone()));
    let coordinator = TriggerCoordinator::new(
      SyncConfig {
        debounce_ms: 10_000,
        ..SyncConfig::default()
      },
      DeviceProfile::default(),
      registry,
      invalidator.clone(),
    );

    let session = Session::user("u1");
    invalidator.start(&session);
    coordinator.start(&session);
    coordinator.full_pass(Trigger::Login).await;
    assert_eq!(invalidator.active_subscriptions(), 0);

    // This pass collapses into the previous one, yet the retry still runs.
    let dropped = coordinator.full_pass(Trigger::VisibilityRegained).await;
    assert!(dropped.is_empty());
    assert_eq!(invalidator.active_subscriptions(), 1);
  }

  #[tokio::test]
  async fn test_triggers_without_session_are_ignored() {
    let counter = Arc::new(AtomicUsize::new(0));
    let coordinator = coordinator_for(
      counting_spec(counter.clone(), Duration::ZERO),
      SyncConfig::default(),
      DeviceProfile::default(),
    );

    let results = coordinator.full_pass(Trigger::Login).await;
    assert!(results.is_empty());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
  }
}
