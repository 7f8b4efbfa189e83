//! Background data synchronization and cache-coherence engine for
//! job-matching clients.
//!
//! The host application embeds a [`SyncEngine`], registers a domain catalog
//! (or its own [`DomainSpec`]s), and forwards four lifecycle moments: login,
//! sign-out, the first user interaction, and visibility regain. The engine
//! keeps every domain's last payload persisted with a capture timestamp,
//! hydrates the host's reactive cache from disk on cold start, refetches when
//! snapshots go stale or a realtime change notification arrives, and never
//! runs more than one fetch per (domain, owner) at a time.
//!
//! ```ignore
//! let config = SyncConfig::load(None)?;
//! let engine = SyncEngine::with_sqlite(config.clone(), device, cache, channel)?;
//! engine.register_all(catalog::seeker_domains(&config, source))?;
//! engine.init(Session::user(user_id)).await;
//! ```

pub mod bridge;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod freshness;
pub mod realtime;
pub mod session;
pub mod snapshot;
pub mod sync;
pub mod triggers;

pub use bridge::{CacheKey, QueryCacheBridge, ReactiveCache};
pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use realtime::{ChangeEvent, ChangeKind, OwnerFilter, RealtimeChannel};
pub use session::Session;
pub use snapshot::{CacheSnapshot, KeyValueStorage, SnapshotStore};
pub use sync::{DomainSpec, OwnerScope, Payload, RunOutcome};
pub use triggers::{DeviceProfile, Trigger};
