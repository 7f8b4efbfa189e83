use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine tuning: every window, interval, and debounce in one table.
///
/// The engine works without a config file; every field has a default and the
/// catalog carries per-domain defaults. A file only needs the values it wants
/// to change.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Full passes arriving within this window collapse into one.
  pub debounce_ms: u64,
  /// Debounce applied instead when the device profile is constrained.
  pub constrained_debounce_ms: u64,
  /// Delay before the login pass on constrained devices.
  pub idle_defer_ms: u64,
  /// Soft deadline for auxiliary side fetches (signed asset URLs).
  pub side_fetch_timeout_ms: u64,
  /// Per-domain overrides; unlisted domains keep their catalog defaults.
  #[serde(default)]
  pub domains: BTreeMap<String, DomainTuning>,
  /// Snapshot database path; defaults to the platform data directory.
  pub storage_path: Option<PathBuf>,
}

/// Per-domain tuning override. Absent fields keep the catalog default.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DomainTuning {
  pub freshness_window_secs: Option<u64>,
  /// Set to 0 to disable the periodic timer for a domain.
  pub refresh_interval_secs: Option<u64>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 2_000,
      constrained_debounce_ms: 5_000,
      idle_defer_ms: 1_500,
      side_fetch_timeout_ms: 2_000,
      domains: BTreeMap::new(),
      storage_path: None,
    }
  }
}

impl SyncConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./jobsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/jobsync/config.yaml
  /// 4. ~/.config/jobsync/config.yaml
  ///
  /// When no file exists anywhere, the defaults are returned. An explicit
  /// path that does not exist is an error.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("jobsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("jobsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: SyncConfig = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Effective freshness window for a domain, given its catalog default.
  pub fn window_for(&self, domain: &str, default_secs: u64) -> Duration {
    let secs = self
      .domains
      .get(domain)
      .and_then(|t| t.freshness_window_secs)
      .unwrap_or(default_secs);
    Duration::from_secs(secs)
  }

  /// Effective periodic refresh interval for a domain.
  pub fn interval_for(&self, domain: &str, default_secs: u64) -> Duration {
    let secs = self
      .domains
      .get(domain)
      .and_then(|t| t.refresh_interval_secs)
      .unwrap_or(default_secs);
    Duration::from_secs(secs)
  }

  /// Debounce window for full passes under the given device constraint.
  pub fn debounce(&self, constrained: bool) -> Duration {
    if constrained {
      Duration::from_millis(self.constrained_debounce_ms)
    } else {
      Duration::from_millis(self.debounce_ms)
    }
  }

  pub fn idle_defer(&self) -> Duration {
    Duration::from_millis(self.idle_defer_ms)
  }

  pub fn side_fetch_timeout(&self) -> Duration {
    Duration::from_millis(self.side_fetch_timeout_ms)
  }
}
