//! Domain specifications: what to fetch, for whom, and how often.

use color_eyre::Result;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::session::Session;

/// A fetched domain payload: one JSON document (list or aggregate object)
/// replaced wholesale on every update.
pub type Payload = Value;

/// A boxed future that resolves to a fetched payload.
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Payload>> + Send>>;

/// A factory function that creates fetch futures for an owner key.
pub type FetchFn = Arc<dyn Fn(String) -> FetchFuture + Send + Sync>;

/// Which part of the session a domain's data belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerScope {
  /// Keyed by the individual account (job seeker side).
  User,
  /// Keyed by the organization the account acts for (employer side).
  Organization,
}

impl OwnerScope {
  /// Owner key for a session, or `None` when the session lacks this scope.
  pub fn owner_key(&self, session: &Session) -> Option<String> {
    match self {
      OwnerScope::User => Some(session.user_key()),
      OwnerScope::Organization => session.org_key(),
    }
  }

  /// Raw identifier remote rows are filtered by under this scope.
  pub fn owner_id<'a>(&self, session: &'a Session) -> Option<&'a str> {
    match self {
      OwnerScope::User => Some(&session.user_id),
      OwnerScope::Organization => session.org_id.as_deref(),
    }
  }
}

/// A remote table backing a domain, with the column its rows are owned by.
/// Change notifications for the table invalidate the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableWatch {
  pub table: &'static str,
  pub owner_column: &'static str,
}

/// One synchronized data category. Immutable once registered.
///
/// # Example
///
/// ```ignore
/// let source = source.clone();
/// let spec = DomainSpec::new("jobs", OwnerScope::User, move |owner_key| {
///     let source = source.clone();
///     async move { source.fetch_jobs(&owner_key).await }
///   })
///   .with_freshness_window(Duration::from_secs(180))
///   .with_refresh_interval(Duration::from_secs(240));
/// ```
#[derive(Clone)]
pub struct DomainSpec {
  pub name: &'static str,
  pub scope: OwnerScope,
  pub fetch: FetchFn,
  /// Maximum snapshot age before a non-forced run refetches.
  pub freshness_window: Duration,
  /// Period of the forced background refresh timer. Zero disables it.
  pub refresh_interval: Duration,
  /// Remote tables whose change events force a refetch.
  pub watches: &'static [TableWatch],
}

impl DomainSpec {
  /// Create a domain with the given fetcher and default tuning.
  ///
  /// The fetcher is a closure receiving the owner key; it is called each
  /// time the registry decides this domain needs data.
  pub fn new<F, Fut>(name: &'static str, scope: OwnerScope, fetcher: F) -> Self
  where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload>> + Send + 'static,
  {
    Self {
      name,
      scope,
      fetch: Arc::new(move |owner_key| Box::pin(fetcher(owner_key))),
      freshness_window: Duration::from_secs(180),
      refresh_interval: Duration::from_secs(300),
      watches: &[],
    }
  }

  pub fn with_freshness_window(mut self, window: Duration) -> Self {
    self.freshness_window = window;
    self
  }

  pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
    self.refresh_interval = interval;
    self
  }

  pub fn with_watches(mut self, watches: &'static [TableWatch]) -> Self {
    self.watches = watches;
    self
  }
}

impl std::fmt::Debug for DomainSpec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DomainSpec")
      .field("name", &self.name)
      .field("scope", &self.scope)
      .field("freshness_window", &self.freshness_window)
      .field("refresh_interval", &self.refresh_interval)
      .field("watches", &self.watches)
      .finish_non_exhaustive()
  }
}
