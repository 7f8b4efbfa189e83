//! Freshness policy: pure decisions about snapshot age.
//!
//! A snapshot is fresh while its age stays strictly inside the domain's
//! freshness window. Everything that consumes these decisions (skip or
//! refetch) lives elsewhere; this module only answers the question.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Age of a capture instant relative to `now`.
///
/// Negative when `captured_at` lies in the future, which can happen across
/// clock adjustments. Callers treat a negative age as fresh.
pub fn age(captured_at: DateTime<Utc>, now: DateTime<Utc>) -> ChronoDuration {
  now.signed_duration_since(captured_at)
}

/// Whether a capture instant is still inside the freshness window.
pub fn is_fresh(captured_at: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> bool {
  match ChronoDuration::from_std(window) {
    Ok(window) => age(captured_at, now) < window,
    // Windows beyond chrono's range never expire.
    Err(_) => true,
  }
}
