//! The sync core: domain specifications and the registry that runs them.
//!
//! A domain is one category of remote data (job feed, applications,
//! conversations, ...) fetched wholesale for a single owner. The registry
//! holds every registered domain and funnels all fetches through one
//! pipeline:
//! - Freshness check against the persisted snapshot
//! - At most one in-flight fetch per (domain, owner)
//! - Snapshot write plus UI cache push on success, no-op on failure

mod domain;
mod registry;

pub use domain::{DomainSpec, FetchFn, FetchFuture, OwnerScope, Payload, TableWatch};
pub use registry::{DomainRegistry, RunOutcome};
