//! The remote data source boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Owner-scoped query for the rows backing one domain.
///
/// `table` names a logical collection; implementations decide how it maps
/// onto their API (a table, a view, an RPC). Rows must be restricted to
/// those whose `owner_column` matches the requested owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainFilter {
  pub table: &'static str,
  pub owner_column: &'static str,
  /// Lower bound on a row's update timestamp, for paginated tables.
  /// `None` fetches the owner's rows wholesale.
  pub updated_since: Option<DateTime<Utc>>,
}

impl DomainFilter {
  pub fn new(table: &'static str, owner_column: &'static str) -> Self {
    Self {
      table,
      owner_column,
      updated_since: None,
    }
  }

  pub fn with_updated_since(mut self, since: DateTime<Utc>) -> Self {
    self.updated_since = Some(since);
    self
  }
}

/// Backend access the catalog fetchers run on.
#[async_trait]
pub trait RemoteSource: Send + Sync {
  /// Fetch the rows backing one domain. `owner_id` is the raw user or
  /// organization identifier the filter column is matched against.
  async fn fetch_rows(&self, owner_id: &str, filter: &DomainFilter) -> Result<Vec<Value>>;

  /// Resolve a short-lived signed URL for a stored media asset.
  async fn signed_asset_url(&self, bucket: &str, path: &str) -> Result<String>;
}

/// Await a side fetch with a soft deadline.
///
/// Timeouts and failures yield `None` and the caller proceeds without the
/// value; an auxiliary lookup is never allowed to fail or stall the fetch
/// it decorates.
pub async fn soft_timeout<T, F>(limit: Duration, what: &'static str, fut: F) -> Option<T>
where
  F: Future<Output = Result<T>>,
{
  match tokio::time::timeout(limit, fut).await {
    Ok(Ok(value)) => Some(value),
    Ok(Err(e)) => {
      debug!(what, error = %e, "side fetch failed, proceeding without it");
      None
    }
    Err(_) => {
      debug!(
        what,
        limit_ms = limit.as_millis() as u64,
        "side fetch timed out, proceeding without it"
      );
      None
    }
  }
}
