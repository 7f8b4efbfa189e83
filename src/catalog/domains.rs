//! Role-specific domain lists built from one tuning table.
//!
//! Both catalogs ride the same table shape; the seeker list keys everything
//! by the user, the employer list by the organization. Default windows and
//! intervals live here, `SyncConfig` overrides them per domain.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::models::{
  Application, CompanyProfile, Conversation, Interview, JobPosting, PipelineCandidate, Profile,
  SavedItem, UnreadCounts,
};
use super::source::{soft_timeout, DomainFilter, RemoteSource};
use crate::config::SyncConfig;
use crate::session;
use crate::sync::{DomainSpec, OwnerScope, Payload, TableWatch};

/// How a domain's rows become its payload document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadShape {
  Profile,
  CompanyProfile,
  Jobs,
  Applications,
  SavedItems,
  Conversations,
  Unread,
  Interviews,
  Pipeline,
}

/// One row of the catalog tuning table.
struct DomainDef {
  name: &'static str,
  scope: OwnerScope,
  shape: PayloadShape,
  /// Remote collection the payload is fetched from.
  table: &'static str,
  /// Column rows are owner-filtered by.
  owner_column: &'static str,
  window_secs: u64,
  interval_secs: u64,
  watches: &'static [TableWatch],
}

const SEEKER_DOMAINS: &[DomainDef] = &[
  DomainDef {
    name: "profile",
    scope: OwnerScope::User,
    shape: PayloadShape::Profile,
    table: "profiles",
    owner_column: "user_id",
    window_secs: 600,
    interval_secs: 300,
    watches: &[TableWatch {
      table: "profiles",
      owner_column: "user_id",
    }],
  },
  DomainDef {
    name: "jobs",
    scope: OwnerScope::User,
    shape: PayloadShape::Jobs,
    table: "job_postings",
    owner_column: "recommended_to",
    window_secs: 180,
    interval_secs: 240,
    watches: &[TableWatch {
      table: "job_postings",
      owner_column: "recommended_to",
    }],
  },
  DomainDef {
    name: "applications",
    scope: OwnerScope::User,
    shape: PayloadShape::Applications,
    table: "applications",
    owner_column: "seeker_id",
    window_secs: 180,
    interval_secs: 300,
    watches: &[TableWatch {
      table: "applications",
      owner_column: "seeker_id",
    }],
  },
  DomainDef {
    name: "saved_items",
    scope: OwnerScope::User,
    shape: PayloadShape::SavedItems,
    table: "saved_jobs",
    owner_column: "seeker_id",
    window_secs: 300,
    interval_secs: 300,
    watches: &[TableWatch {
      table: "saved_jobs",
      owner_column: "seeker_id",
    }],
  },
  DomainDef {
    name: "conversations",
    scope: OwnerScope::User,
    shape: PayloadShape::Conversations,
    table: "conversations",
    owner_column: "participant_id",
    window_secs: 60,
    interval_secs: 180,
    watches: &[
      TableWatch {
        table: "conversations",
        owner_column: "participant_id",
      },
      TableWatch {
        table: "messages",
        owner_column: "recipient_id",
      },
    ],
  },
  DomainDef {
    name: "unread",
    scope: OwnerScope::User,
    shape: PayloadShape::Unread,
    table: "messages",
    owner_column: "recipient_id",
    window_secs: 60,
    interval_secs: 180,
    watches: &[TableWatch {
      table: "messages",
      owner_column: "recipient_id",
    }],
  },
  DomainDef {
    name: "interviews",
    scope: OwnerScope::User,
    shape: PayloadShape::Interviews,
    table: "interviews",
    owner_column: "candidate_id",
    window_secs: 300,
    interval_secs: 300,
    watches: &[TableWatch {
      table: "interviews",
      owner_column: "candidate_id",
    }],
  },
];

const EMPLOYER_DOMAINS: &[DomainDef] = &[
  DomainDef {
    name: "company_profile",
    scope: OwnerScope::Organization,
    shape: PayloadShape::CompanyProfile,
    table: "company_profiles",
    owner_column: "org_id",
    window_secs: 600,
    interval_secs: 300,
    watches: &[TableWatch {
      table: "company_profiles",
      owner_column: "org_id",
    }],
  },
  DomainDef {
    name: "postings",
    scope: OwnerScope::Organization,
    shape: PayloadShape::Jobs,
    table: "job_postings",
    owner_column: "org_id",
    window_secs: 180,
    interval_secs: 240,
    watches: &[TableWatch {
      table: "job_postings",
      owner_column: "org_id",
    }],
  },
  DomainDef {
    name: "pipeline",
    scope: OwnerScope::Organization,
    shape: PayloadShape::Pipeline,
    table: "pipeline_candidates",
    owner_column: "org_id",
    window_secs: 120,
    interval_secs: 180,
    watches: &[
      TableWatch {
        table: "pipeline_candidates",
        owner_column: "org_id",
      },
      TableWatch {
        table: "applications",
        owner_column: "org_id",
      },
    ],
  },
  DomainDef {
    name: "conversations",
    scope: OwnerScope::Organization,
    shape: PayloadShape::Conversations,
    table: "conversations",
    owner_column: "org_id",
    window_secs: 60,
    interval_secs: 180,
    watches: &[
      TableWatch {
        table: "conversations",
        owner_column: "org_id",
      },
      TableWatch {
        table: "messages",
        owner_column: "recipient_org_id",
      },
    ],
  },
  DomainDef {
    name: "unread",
    scope: OwnerScope::Organization,
    shape: PayloadShape::Unread,
    table: "messages",
    owner_column: "recipient_org_id",
    window_secs: 60,
    interval_secs: 180,
    watches: &[TableWatch {
      table: "messages",
      owner_column: "recipient_org_id",
    }],
  },
  DomainDef {
    name: "interviews",
    scope: OwnerScope::Organization,
    shape: PayloadShape::Interviews,
    table: "interviews",
    owner_column: "org_id",
    window_secs: 300,
    interval_secs: 300,
    watches: &[TableWatch {
      table: "interviews",
      owner_column: "org_id",
    }],
  },
];

/// Domain specs for a signed-in job seeker.
pub fn seeker_domains(config: &SyncConfig, source: Arc<dyn RemoteSource>) -> Vec<DomainSpec> {
  build_catalog(SEEKER_DOMAINS, config, source)
}

/// Domain specs for an employer portal session.
pub fn employer_domains(config: &SyncConfig, source: Arc<dyn RemoteSource>) -> Vec<DomainSpec> {
  build_catalog(EMPLOYER_DOMAINS, config, source)
}

fn build_catalog(
  defs: &'static [DomainDef],
  config: &SyncConfig,
  source: Arc<dyn RemoteSource>,
) -> Vec<DomainSpec> {
  let side_timeout = config.side_fetch_timeout();
  defs
    .iter()
    .map(|def| {
      let source = source.clone();
      let ledger = Arc::new(ApplicationLedger::default());
      DomainSpec::new(def.name, def.scope, move |owner_key| {
        let source = source.clone();
        let ledger = ledger.clone();
        async move { fetch_payload(def, source, ledger, &owner_key, side_timeout).await }
      })
      .with_freshness_window(config.window_for(def.name, def.window_secs))
      .with_refresh_interval(config.interval_for(def.name, def.interval_secs))
      .with_watches(def.watches)
    })
    .collect()
}

async fn fetch_payload(
  def: &'static DomainDef,
  source: Arc<dyn RemoteSource>,
  ledger: Arc<ApplicationLedger>,
  owner_key: &str,
  side_timeout: Duration,
) -> Result<Payload> {
  let owner = session::owner_id(owner_key);
  let mut filter = DomainFilter::new(def.table, def.owner_column);
  // Applications paginate on the update timestamp: after the first full
  // fetch, only rows newer than the cursor come over the wire.
  if def.shape == PayloadShape::Applications {
    if let Some(since) = ledger.cursor(owner) {
      debug!(domain = def.name, owner, %since, "incremental fetch from cursor");
      filter = filter.with_updated_since(since);
    }
  }
  let rows = source.fetch_rows(owner, &filter).await?;

  match def.shape {
    PayloadShape::Profile => {
      let mut profile: Profile = decode_single(def.name, rows)?;
      if let Some(path) = profile.avatar_path.clone() {
        profile.avatar_url = soft_timeout(side_timeout, "avatar url", async {
          source.signed_asset_url("avatars", &path).await
        })
        .await;
      }
      Ok(serde_json::to_value(profile)?)
    }
    PayloadShape::CompanyProfile => {
      let mut profile: CompanyProfile = decode_single(def.name, rows)?;
      if let Some(path) = profile.logo_path.clone() {
        profile.logo_url = soft_timeout(side_timeout, "logo url", async {
          source.signed_asset_url("logos", &path).await
        })
        .await;
      }
      Ok(serde_json::to_value(profile)?)
    }
    PayloadShape::Jobs => {
      let mut postings: Vec<JobPosting> = decode_rows(def.name, rows);
      postings.sort_by(|a, b| b.posted_at.cmp(&a.posted_at));
      Ok(serde_json::to_value(postings)?)
    }
    PayloadShape::Applications => {
      let fetched: Vec<Application> = decode_rows(def.name, rows);
      let mut applications = ledger.merge(owner, fetched);
      applications.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
      Ok(serde_json::to_value(applications)?)
    }
    PayloadShape::SavedItems => {
      let mut items: Vec<SavedItem> = decode_rows(def.name, rows);
      items.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
      Ok(serde_json::to_value(items)?)
    }
    PayloadShape::Conversations => {
      let mut conversations: Vec<Conversation> = decode_rows(def.name, rows);
      conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
      Ok(serde_json::to_value(conversations)?)
    }
    PayloadShape::Unread => {
      let messages: Vec<MessageRow> = decode_rows(def.name, rows);
      Ok(serde_json::to_value(aggregate_unread(&messages))?)
    }
    PayloadShape::Interviews => {
      let mut interviews: Vec<Interview> = decode_rows(def.name, rows);
      interviews.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
      Ok(serde_json::to_value(interviews)?)
    }
    PayloadShape::Pipeline => {
      let mut candidates: Vec<PipelineCandidate> = decode_rows(def.name, rows);
      candidates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
      Ok(serde_json::to_value(candidates)?)
    }
  }
}

/// Per-owner merge state behind the incremental applications fetch.
///
/// Rows arriving on a cursored fetch are folded into the owner's known set
/// by id, last write wins on the update timestamp. Applications transition
/// through statuses ("withdrawn" included) and are never hard-deleted
/// remotely, so a merged row can only go stale, not dangle. State is
/// in-process only; a restart falls back to a full fetch.
#[derive(Default)]
struct ApplicationLedger {
  by_owner: Mutex<HashMap<String, OwnerEntry>>,
}

struct OwnerEntry {
  cursor: DateTime<Utc>,
  by_id: BTreeMap<String, Application>,
}

impl ApplicationLedger {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, OwnerEntry>> {
    match self.by_owner.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Cursor for an owner, or `None` before the first successful fetch.
  fn cursor(&self, owner: &str) -> Option<DateTime<Utc>> {
    self.lock().get(owner).map(|entry| entry.cursor)
  }

  /// Fold fetched rows into the owner's set and advance the cursor to the
  /// newest `updated_at` seen. Returns the full merged list.
  fn merge(&self, owner: &str, fetched: Vec<Application>) -> Vec<Application> {
    let mut by_owner = self.lock();
    let entry = by_owner.entry(owner.to_string()).or_insert_with(|| OwnerEntry {
      cursor: DateTime::<Utc>::MIN_UTC,
      by_id: BTreeMap::new(),
    });
    for application in fetched {
      if application.updated_at > entry.cursor {
        entry.cursor = application.updated_at;
      }
      entry.by_id.insert(application.id.clone(), application);
    }
    entry.by_id.values().cloned().collect()
  }
}

/// The slice of a message row the unread counter needs.
#[derive(Debug, Deserialize)]
struct MessageRow {
  conversation_id: String,
  #[serde(default)]
  read: bool,
}

fn aggregate_unread(messages: &[MessageRow]) -> UnreadCounts {
  let mut by_conversation = BTreeMap::new();
  for message in messages.iter().filter(|m| !m.read) {
    *by_conversation.entry(message.conversation_id.clone()).or_insert(0) += 1;
  }
  UnreadCounts {
    total: by_conversation.values().sum(),
    by_conversation,
  }
}

/// Decode rows, skipping the ones that no longer match the model.
fn decode_rows<T: DeserializeOwned>(domain: &str, rows: Vec<Value>) -> Vec<T> {
  rows
    .into_iter()
    .filter_map(|row| match serde_json::from_value(row) {
      Ok(decoded) => Some(decoded),
      Err(e) => {
        warn!(domain, error = %e, "skipping malformed row");
        None
      }
    })
    .collect()
}

/// Decode the one row a singleton domain expects.
fn decode_single<T: DeserializeOwned>(domain: &str, mut rows: Vec<Value>) -> Result<T> {
  if rows.is_empty() {
    return Err(eyre!("No {} row for this owner", domain));
  }
  if rows.len() > 1 {
    warn!(domain, rows = rows.len(), "expected one row, using the first");
  }
  Ok(serde_json::from_value(rows.remove(0))?)
}
