//! Realtime change notifications driving out-of-band refreshes.
//!
//! The engine never applies change payloads directly. A notification only
//! says "this table changed for this owner"; the registry then refetches the
//! affected domain wholesale, so realtime and pull-based sync share one
//! write path.

use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::sync::DomainRegistry;

/// What happened to a remote row. Notifications carry no row payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

/// A change notification for one watched table.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
  pub table: String,
  pub kind: ChangeKind,
}

/// Owner predicate a subscription is scoped by. The channel implementation
/// must only deliver changes to rows whose `column` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerFilter {
  pub column: String,
  pub value: String,
}

impl OwnerFilter {
  pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      column: column.into(),
      value: value.into(),
    }
  }
}

/// Live feed of change events for one subscription.
/// Dropping the feed unsubscribes.
pub struct ChangeFeed {
  rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeFeed {
  pub fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
    Self { rx }
  }

  /// Feed plus the sender that fills it; for channel implementations.
  pub fn pair() -> (mpsc::UnboundedSender<ChangeEvent>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self::new(rx))
  }

  /// Next event, or `None` once the channel side is gone.
  pub async fn recv(&mut self) -> Option<ChangeEvent> {
    self.rx.recv().await
  }

  /// Already-queued event, if any. Used to collapse bursts.
  pub fn try_recv(&mut self) -> Option<ChangeEvent> {
    self.rx.try_recv().ok()
  }
}

/// Push notification source (a realtime websocket, an in-process hub, ...).
pub trait RealtimeChannel: Send + Sync {
  /// Open an owner-scoped subscription on one table.
  fn subscribe(&self, table: &str, filter: &OwnerFilter) -> Result<ChangeFeed>;
}

struct HubSubscriber {
  filter: OwnerFilter,
  tx: mpsc::UnboundedSender<ChangeEvent>,
}

/// In-process hub: test double and relay point for hosts that bridge an
/// external realtime connection into the engine.
#[derive(Default)]
pub struct MemoryRealtimeHub {
  topics: Mutex<HashMap<String, Vec<HubSubscriber>>>,
}

impl MemoryRealtimeHub {
  pub fn new() -> Self {
    Self::default()
  }

  fn topics(&self) -> MutexGuard<'_, HashMap<String, Vec<HubSubscriber>>> {
    match self.topics.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Deliver a change on one owned row to every matching subscriber.
  pub fn publish(&self, table: &str, kind: ChangeKind, owner_column: &str, owner_value: &str) {
    let mut topics = self.topics();
    let Some(subscribers) = topics.get_mut(table) else {
      return;
    };

    subscribers.retain(|sub| {
      if sub.tx.is_closed() {
        return false;
      }
      if sub.filter.column == owner_column && sub.filter.value == owner_value {
        let event = ChangeEvent {
          table: table.to_string(),
          kind,
        };
        return sub.tx.send(event).is_ok();
      }
      true
    });
  }

  /// Live subscriber count for a table.
  pub fn subscriber_count(&self, table: &str) -> usize {
    let mut topics = self.topics();
    match topics.get_mut(table) {
      Some(subscribers) => {
        subscribers.retain(|sub| !sub.tx.is_closed());
        subscribers.len()
      }
      None => 0,
    }
  }
}

impl RealtimeChannel for MemoryRealtimeHub {
  fn subscribe(&self, table: &str, filter: &OwnerFilter) -> Result<ChangeFeed> {
    let (tx, feed) = ChangeFeed::pair();
    self.topics().entry(table.to_string()).or_default().push(HubSubscriber {
      filter: filter.clone(),
      tx,
    });
    Ok(feed)
  }
}

#[derive(Default)]
struct InvalidatorState {
  session: Option<Session>,
  /// One task per (domain, table) subscription.
  active: HashMap<(String, String), JoinHandle<()>>,
}

/// Opens the per-(domain, table) subscriptions for a session and turns each
/// incoming event into a forced registry run.
pub struct RealtimeInvalidator {
  channel: Arc<dyn RealtimeChannel>,
  registry: Arc<DomainRegistry>,
  state: Mutex<InvalidatorState>,
}

impl RealtimeInvalidator {
  pub fn new(channel: Arc<dyn RealtimeChannel>, registry: Arc<DomainRegistry>) -> Self {
    Self {
      channel,
      registry,
      state: Mutex::new(InvalidatorState::default()),
    }
  }

  fn state(&self) -> MutexGuard<'_, InvalidatorState> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Adopt a session and open its subscriptions.
  pub fn start(&self, session: &Session) {
    {
      let mut state = self.state();
      for (_, handle) in state.active.drain() {
        handle.abort();
      }
      state.session = Some(session.clone());
    }
    self.ensure_subscribed();
  }

  /// Open any subscription that is missing or whose task has ended.
  ///
  /// Called on start and again on every full pass, so a subscription that
  /// failed to open (or died) comes back without a dedicated retry loop.
  pub fn ensure_subscribed(&self) {
    let mut state = self.state();
    let Some(session) = state.session.clone() else {
      return;
    };

    state.active.retain(|_, handle| !handle.is_finished());

    for spec in self.registry.specs() {
      let (Some(owner_key), Some(owner_id)) = (
        spec.scope.owner_key(&session),
        spec.scope.owner_id(&session).map(str::to_string),
      ) else {
        continue;
      };

      for watch in spec.watches {
        let key = (spec.name.to_string(), watch.table.to_string());
        if state.active.contains_key(&key) {
          continue;
        }

        let filter = OwnerFilter::new(watch.owner_column, owner_id.as_str());
        match self.channel.subscribe(watch.table, &filter) {
          Ok(feed) => {
            debug!(domain = spec.name, table = watch.table, "subscription opened");
            let handle =
              spawn_invalidation_task(self.registry.clone(), spec.name, owner_key.clone(), feed);
            state.active.insert(key, handle);
          }
          Err(e) => {
            warn!(
              domain = spec.name,
              table = watch.table,
              error = %e,
              "subscription failed, will retry on next full pass"
            );
          }
        }
      }
    }
  }

  /// Drop every subscription and forget the session.
  pub fn stop(&self) {
    let mut state = self.state();
    let dropped = state.active.len();
    for (_, handle) in state.active.drain() {
      handle.abort();
    }
    state.session = None;
    if dropped > 0 {
      info!(dropped, "realtime subscriptions closed");
    }
  }

  /// Number of live subscription tasks.
  pub fn active_subscriptions(&self) -> usize {
    let mut state = self.state();
    state.active.retain(|_, handle| !handle.is_finished());
    state.active.len()
  }
}

fn spawn_invalidation_task(
  registry: Arc<DomainRegistry>,
  domain: &'static str,
  owner_key: String,
  mut feed: ChangeFeed,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    while let Some(event) = feed.recv().await {
      // Collapse a burst of queued events into one forced run.
      let mut collapsed = 0;
      while feed.try_recv().is_some() {
        collapsed += 1;
      }
      debug!(
        domain,
        table = %event.table,
        kind = ?event.kind,
        collapsed,
        "change notification, forcing refresh"
      );
      if let Err(e) = registry.run(domain, &owner_key, true).await {
        warn!(domain, error = %e, "forced refresh failed");
      }
    }
    debug!(domain, "change feed closed");
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bridge::{MemoryCache, QueryCacheBridge};
  use crate::snapshot::{MemoryStorage, SnapshotStore};
  use crate::sync::{DomainSpec, OwnerScope, TableWatch};
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn test_registry() -> Arc<DomainRegistry> {
    registry_with_store().0
  }

  fn registry_with_store() -> (Arc<DomainRegistry>, SnapshotStore) {
    let store = SnapshotStore::new(Arc::new(MemoryStorage::new()));
    let bridge = QueryCacheBridge::new(Arc::new(MemoryCache::new()));
    (Arc::new(DomainRegistry::new(store.clone(), bridge)), store)
  }

  fn watched_spec(
    name: &'static str,
    watches: &'static [TableWatch],
    counter: Arc<AtomicUsize>,
  ) -> DomainSpec {
    DomainSpec::new(name, OwnerScope::User, move |_owner| {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!([]))
      }
    })
    // Large window proves realtime runs bypass freshness.
    .with_freshness_window(Duration::from_secs(3_600))
    .with_watches(watches)
  }

  const APP_WATCH: &[TableWatch] = &[TableWatch {
    table: "applications",
    owner_column: "seeker_id",
  }];

  #[tokio::test]
  async fn test_hub_routes_by_owner_filter() {
    let hub = MemoryRealtimeHub::new();
    let mut mine = hub
      .subscribe("applications", &OwnerFilter::new("seeker_id", "u1"))
      .unwrap();
    let mut theirs = hub
      .subscribe("applications", &OwnerFilter::new("seeker_id", "u2"))
      .unwrap();

    hub.publish("applications", ChangeKind::Insert, "seeker_id", "u1");

    assert!(mine.try_recv().is_some());
    assert!(theirs.try_recv().is_none());
  }

  #[tokio::test]
  async fn test_dropped_feed_unsubscribes() {
    let hub = MemoryRealtimeHub::new();
    let feed = hub
      .subscribe("applications", &OwnerFilter::new("seeker_id", "u1"))
      .unwrap();
    assert_eq!(hub.subscriber_count("applications"), 1);

    drop(feed);
    assert_eq!(hub.subscriber_count("applications"), 0);
  }

  #[tokio::test]
  async fn test_change_event_forces_refresh() {
    let (registry, store) = registry_with_store();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
      .register(watched_spec("applications", APP_WATCH, counter.clone()))
      .unwrap();

    let hub = Arc::new(MemoryRealtimeHub::new());
    let invalidator = RealtimeInvalidator::new(hub.clone(), registry.clone());
    invalidator.start(&Session::user("u1"));
    assert_eq!(invalidator.active_subscriptions(), 1);

    // Seed a fresh snapshot; only a forced run can refetch now.
    registry.run("applications", "user:u1", true).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    let before = store.read("applications", "user:u1").unwrap().captured_at;

    hub.publish("applications", ChangeKind::Update, "seeker_id", "u1");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    let after = store.read("applications", "user:u1").unwrap().captured_at;
    assert!(after > before);
  }

  #[tokio::test]
  async fn test_event_burst_collapses_into_one_run() {
    let registry = test_registry();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
      .register(watched_spec("applications", APP_WATCH, counter.clone()))
      .unwrap();

    let hub = Arc::new(MemoryRealtimeHub::new());
    let invalidator = RealtimeInvalidator::new(hub.clone(), registry.clone());
    invalidator.start(&Session::user("u1"));

    for _ in 0..5 {
      hub.publish("applications", ChangeKind::Insert, "seeker_id", "u1");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_one_table_fans_out_to_every_watching_domain() {
    const MSG_WATCH: &[TableWatch] = &[TableWatch {
      table: "messages",
      owner_column: "recipient_id",
    }];

    let registry = test_registry();
    let conversations = Arc::new(AtomicUsize::new(0));
    let unread = Arc::new(AtomicUsize::new(0));
    registry
      .register(watched_spec("conversations", MSG_WATCH, conversations.clone()))
      .unwrap();
    registry
      .register(watched_spec("unread", MSG_WATCH, unread.clone()))
      .unwrap();

    let hub = Arc::new(MemoryRealtimeHub::new());
    let invalidator = RealtimeInvalidator::new(hub.clone(), registry.clone());
    invalidator.start(&Session::user("u1"));
    assert_eq!(invalidator.active_subscriptions(), 2);

    hub.publish("messages", ChangeKind::Insert, "recipient_id", "u1");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(conversations.load(Ordering::SeqCst), 1);
    assert_eq!(unread.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_other_owners_events_are_ignored() {
    let registry = test_registry();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
      .register(watched_spec("applications", APP_WATCH, counter.clone()))
      .unwrap();

    let hub = Arc::new(MemoryRealtimeHub::new());
    let invalidator = RealtimeInvalidator::new(hub.clone(), registry.clone());
    invalidator.start(&Session::user("u1"));

    hub.publish("applications", ChangeKind::Insert, "seeker_id", "u2");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(counter.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_stop_closes_every_subscription() {
    let registry = test_registry();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
      .register(watched_spec("applications", APP_WATCH, counter.clone()))
      .unwrap();

    let hub = Arc::new(MemoryRealtimeHub::new());
    let invalidator = RealtimeInvalidator::new(hub.clone(), registry.clone());
    invalidator.start(&Session::user("u1"));
    invalidator.stop();

    assert_eq!(invalidator.active_subscriptions(), 0);

    hub.publish("applications", ChangeKind::Insert, "seeker_id", "u1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_failed_subscription_retries_on_next_ensure() {
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

    let registry = test_registry();
    let counter = Arc::new(AtomicUsize::new(0));
    registry
      .register(watched_spec("applications", APP_WATCH, counter))
      .unwrap();

    let channel = Arc::new(FlakyChannel {
      hub: MemoryRealtimeHub::new(),
      failures_left: AtomicUsize::new(1),
    });
    let invalidator = RealtimeInvalidator::new(channel.clone(), registry.clone());

    invalidator.start(&Session::user("u1"));
    assert_eq!(invalidator.active_subscriptions(), 0);

    // The next full pass calls this again and the subscription comes back.
    invalidator.ensure_subscribed();
    assert_eq!(invalidator.active_subscriptions(), 1);
    assert_eq!(channel.hub.subscriber_count("applications"), 1);
  }
}
