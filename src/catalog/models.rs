//! Typed payload models for the synchronized domains.
//!
//! Catalog fetchers decode remote rows into these types, post-process
//! (sort, aggregate, resolve asset URLs), and store the result as one JSON
//! document. Hosts deserialize cache entries back into the same types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A job posting, as it appears in the seeker feed or the employer list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
  pub id: String,
  pub title: String,
  pub company: String,
  #[serde(default)]
  pub location: Option<String>,
  #[serde(default)]
  pub compensation: Option<String>,
  pub posted_at: DateTime<Utc>,
}

/// One submitted application, seeker side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
  pub id: String,
  pub job_id: String,
  pub job_title: String,
  /// Pipeline status, e.g. "submitted", "in_review", "interview", "offer".
  pub status: String,
  pub submitted_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// A bookmarked posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedItem {
  pub id: String,
  pub job_id: String,
  pub title: String,
  pub saved_at: DateTime<Utc>,
}

/// A message thread header. Message bodies are not synchronized here; the
/// host loads them on demand when a thread opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
  pub id: String,
  /// Display name of the other party (recruiter or candidate).
  pub counterpart: String,
  #[serde(default)]
  pub subject: Option<String>,
  pub last_message_at: DateTime<Utc>,
  #[serde(default)]
  pub last_message_preview: Option<String>,
}

/// Unread message counts, total and per conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnreadCounts {
  pub total: u64,
  pub by_conversation: BTreeMap<String, u64>,
}

/// A scheduled interview, visible to both roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interview {
  pub id: String,
  pub application_id: String,
  pub scheduled_at: DateTime<Utc>,
  #[serde(default)]
  pub location: Option<String>,
  /// "scheduled", "completed", or "cancelled".
  pub status: String,
}

/// The seeker's own profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
  pub id: String,
  pub display_name: String,
  #[serde(default)]
  pub headline: Option<String>,
  /// Storage path of the avatar asset, if one was uploaded.
  #[serde(default)]
  pub avatar_path: Option<String>,
  /// Short-lived signed URL resolved at fetch time; absent when the side
  /// fetch timed out or no avatar exists.
  #[serde(default)]
  pub avatar_url: Option<String>,
}

/// The employer's organization profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub tagline: Option<String>,
  #[serde(default)]
  pub logo_path: Option<String>,
  #[serde(default)]
  pub logo_url: Option<String>,
}

/// A candidate in the employer's hiring pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCandidate {
  pub id: String,
  pub application_id: String,
  pub candidate_name: String,
  /// Pipeline stage, e.g. "applied", "screening", "interview", "offer".
  pub stage: String,
  pub applied_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_optional_fields_default_when_absent() {
    let posting: JobPosting = serde_json::from_value(json!({
      "id": "j1",
      "title": "Platform engineer",
      "company": "Acme",
      "posted_at": "2026-08-20T10:00:00Z"
    }))
    .unwrap();

    assert_eq!(posting.location, None);
    assert_eq!(posting.compensation, None);
  }

  #[test]
  fn test_profile_asset_fields_are_independent() {
    let profile: Profile = serde_json::from_value(json!({
      "id": "u1",
      "display_name": "Ada",
      "avatar_path": "u1/avatar.png"
    }))
    .unwrap();

    // The signed URL never comes from the row; a fetcher fills it in.
    assert_eq!(profile.avatar_path.as_deref(), Some("u1/avatar.png"));
    assert_eq!(profile.avatar_url, None);
  }
}
