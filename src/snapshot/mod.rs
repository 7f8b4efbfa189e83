//! Persistent snapshots of fetched domain payloads.
//!
//! This module keeps the last successful payload for every (domain, owner)
//! pair so that a cold start can paint from disk before any network round
//! trip:
//! - One snapshot per (domain, owner), replaced wholesale on each update
//! - Capture timestamps drive the freshness policy
//! - Sign-out purges every snapshot in one stroke

mod storage;
mod store;

pub use storage::{KeyValueStorage, MemoryStorage, SqliteStorage};
pub use store::{CacheSnapshot, SnapshotStore};
