//! One-way bridge into the host's reactive query cache.
//!
//! The engine only ever writes entries; reading, subscriptions, and
//! re-render plumbing belong to the host. Consecutive pushes with identical
//! content are suppressed by payload fingerprint so observers are not woken
//! for a no-op.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Key of one entry in the host cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  pub domain: String,
  pub owner_key: String,
}

impl CacheKey {
  pub fn new(domain: impl Into<String>, owner_key: impl Into<String>) -> Self {
    Self {
      domain: domain.into(),
      owner_key: owner_key.into(),
    }
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.domain, self.owner_key)
  }
}

/// The host's reactive UI cache.
///
/// Implementations are expected to notify their own observers when an entry
/// changes; the engine never reads entries back.
pub trait ReactiveCache: Send + Sync {
  fn set_entry(&self, key: &CacheKey, value: Value);
}

/// In-memory cache double for tests and headless hosts.
#[derive(Default)]
pub struct MemoryCache {
  entries: Mutex<HashMap<CacheKey, Value>>,
  writes: AtomicUsize,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &CacheKey) -> Option<Value> {
    match self.entries.lock() {
      Ok(entries) => entries.get(key).cloned(),
      Err(poisoned) => poisoned.into_inner().get(key).cloned(),
    }
  }

  pub fn len(&self) -> usize {
    match self.entries.lock() {
      Ok(entries) => entries.len(),
      Err(poisoned) => poisoned.into_inner().len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// How many times `set_entry` ran. Lets tests observe suppressed writes.
  pub fn write_count(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }
}

impl ReactiveCache for MemoryCache {
  fn set_entry(&self, key: &CacheKey, value: Value) {
    self.writes.fetch_add(1, Ordering::SeqCst);
    match self.entries.lock() {
      Ok(mut entries) => {
        entries.insert(key.clone(), value);
      }
      Err(poisoned) => {
        poisoned.into_inner().insert(key.clone(), value);
      }
    }
  }
}

/// Pushes fetched payloads into the host cache, deduplicating by content.
#[derive(Clone)]
pub struct QueryCacheBridge {
  cache: Arc<dyn ReactiveCache>,
  fingerprints: Arc<Mutex<HashMap<CacheKey, String>>>,
}

impl QueryCacheBridge {
  pub fn new(cache: Arc<dyn ReactiveCache>) -> Self {
    Self {
      cache,
      fingerprints: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// Push a payload into the host cache.
  ///
  /// When the payload fingerprint matches the last push for the same key the
  /// write is skipped, so refetches that change nothing do not trigger a
  /// re-render.
  pub fn push(&self, domain: &str, owner_key: &str, payload: Value) {
    let key = CacheKey::new(domain, owner_key);
    let digest = fingerprint(&payload);

    {
      let mut prints = match self.fingerprints.lock() {
        Ok(prints) => prints,
        Err(poisoned) => poisoned.into_inner(),
      };
      if prints.get(&key).map(String::as_str) == Some(digest.as_str()) {
        debug!(%key, "payload unchanged, skipping cache write");
        return;
      }
      prints.insert(key.clone(), digest);
    }

    self.cache.set_entry(&key, payload);
  }

  /// Forget every fingerprint. After this the next push for any key writes
  /// unconditionally; used on teardown so a fresh session starts clean.
  pub fn reset(&self) {
    match self.fingerprints.lock() {
      Ok(mut prints) => prints.clear(),
      Err(poisoned) => {
        warn!("fingerprint lock poisoned, clearing anyway");
        poisoned.into_inner().clear();
      }
    }
  }
}

/// SHA256 over the serialized payload for stable, fixed-length comparison.
fn fingerprint(payload: &Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(payload.to_string().as_bytes());
  let result = hasher.finalize();
  hex::encode(result)
}
