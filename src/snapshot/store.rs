//! Snapshot persistence: one JSON document per (domain, owner) pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::storage::KeyValueStorage;
use crate::freshness;

/// The last successfully fetched payload for one (domain, owner) pair,
/// together with the instant the fetch resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot {
  pub domain: String,
  pub owner_key: String,
  pub payload: Value,
  pub captured_at: DateTime<Utc>,
}

impl CacheSnapshot {
  /// Snapshot captured now.
  pub fn capture(domain: impl Into<String>, owner_key: impl Into<String>, payload: Value) -> Self {
    Self {
      domain: domain.into(),
      owner_key: owner_key.into(),
      payload,
      captured_at: Utc::now(),
    }
  }
}

/// Persisted form; domain and owner live in the storage key.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshot {
  payload: Value,
  captured_at: DateTime<Utc>,
}

/// Reads and writes snapshots through a [`KeyValueStorage`] backend.
///
/// Storage failures never propagate to callers: a failed read is a cache
/// miss, a failed write leaves the previous snapshot in place. Either way
/// the sync pipeline continues and the condition is logged.
#[derive(Clone)]
pub struct SnapshotStore {
  storage: Arc<dyn KeyValueStorage>,
}

impl SnapshotStore {
  pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
    Self { storage }
  }

  fn storage_key(domain: &str, owner_key: &str) -> String {
    format!("snapshot:{}:{}", domain, owner_key)
  }

  /// Read the snapshot for a (domain, owner) pair.
  ///
  /// Returns `None` on a miss, on a storage error, or when the stored
  /// document no longer parses.
  pub fn read(&self, domain: &str, owner_key: &str) -> Option<CacheSnapshot> {
    let key = Self::storage_key(domain, owner_key);

    let value = match self.storage.get(&key) {
      Ok(value) => value?,
      Err(e) => {
        warn!(domain, owner = owner_key, error = %e, "snapshot read failed, treating as miss");
        return None;
      }
    };

    match serde_json::from_str::<StoredSnapshot>(&value) {
      Ok(stored) => Some(CacheSnapshot {
        domain: domain.to_string(),
        owner_key: owner_key.to_string(),
        payload: stored.payload,
        captured_at: stored.captured_at,
      }),
      Err(e) => {
        warn!(domain, owner = owner_key, error = %e, "snapshot corrupt, treating as miss");
        None
      }
    }
  }

  /// Write a snapshot, replacing the previous one wholesale.
  ///
  /// A snapshot older than the one already stored is dropped, so capture
  /// times only ever move forward even if fetches resolve out of order.
  pub fn write(&self, snapshot: &CacheSnapshot) {
    if let Some(existing) = self.read(&snapshot.domain, &snapshot.owner_key) {
      if existing.captured_at > snapshot.captured_at {
        warn!(
          domain = %snapshot.domain,
          owner = %snapshot.owner_key,
          "snapshot older than stored one, dropping write"
        );
        return;
      }
    }

    let stored = StoredSnapshot {
      payload: snapshot.payload.clone(),
      captured_at: snapshot.captured_at,
    };

    let value = match serde_json::to_string(&stored) {
      Ok(value) => value,
      Err(e) => {
        warn!(domain = %snapshot.domain, error = %e, "snapshot serialization failed");
        return;
      }
    };

    let key = Self::storage_key(&snapshot.domain, &snapshot.owner_key);
    if let Err(e) = self.storage.set(&key, &value) {
      warn!(domain = %snapshot.domain, owner = %snapshot.owner_key, error = %e, "snapshot write failed");
    }
  }

  /// Whether the stored snapshot is inside the freshness window.
  /// Missing or unreadable snapshots are stale.
  pub fn is_fresh(&self, domain: &str, owner_key: &str, window: Duration) -> bool {
    match self.read(domain, owner_key) {
      Some(snapshot) => freshness::is_fresh(snapshot.captured_at, window, Utc::now()),
      None => false,
    }
  }

  /// Delete the snapshot for one (domain, owner) pair.
  pub fn remove(&self, domain: &str, owner_key: &str) {
    let key = Self::storage_key(domain, owner_key);
    if let Err(e) = self.storage.remove(&key) {
      warn!(domain, owner = owner_key, error = %e, "snapshot delete failed");
    }
  }

  /// Delete every snapshot. Called on sign-out so no payload from one
  /// account can surface under the next.
  pub fn purge_all(&self) {
    match self.storage.clear() {
      Ok(()) => debug!("all snapshots purged"),
      Err(e) => warn!(error = %e, "snapshot purge failed"),
    }
  }
}
