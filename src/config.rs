use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::cache::SyncPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub directory: DirectoryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Write logs here instead of stderr
  pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
  /// Base URL of the customer API, e.g. https://crm.example.com/api
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Disable to run without a local store (every search goes remote)
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Database file (defaults to $XDG_DATA_HOME/crmcache/cache.db)
  pub path: Option<PathBuf>,
  #[serde(default = "default_trust_window_secs")]
  pub trust_window_secs: u64,
  #[serde(default = "default_min_query_len")]
  pub min_query_len: usize,
  #[serde(default = "default_resync_after_mins")]
  pub resync_after_mins: u64,
}

fn default_true() -> bool {
  true
}

fn default_trust_window_secs() -> u64 {
  30
}

fn default_min_query_len() -> usize {
  2
}

fn default_resync_after_mins() -> u64 {
  60
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      trust_window_secs: default_trust_window_secs(),
      min_query_len: default_min_query_len(),
      resync_after_mins: default_resync_after_mins(),
    }
  }
}

impl CacheConfig {
  pub fn policy(&self) -> SyncPolicy {
    SyncPolicy {
      trust_window: chrono::Duration::seconds(clamp_i64(self.trust_window_secs)),
      min_query_len: self.min_query_len,
      resync_after: chrono::Duration::minutes(clamp_i64(self.resync_after_mins)),
    }
  }
}

/// Keep configured durations inside chrono's range.
fn clamp_i64(value: u64) -> i64 {
  i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1_000_000_000)
}

impl Config {
  /// Read the first config file found.
  ///
  /// An explicit `--config` path must exist. Otherwise `./crmcache.yaml` is
  /// tried, then `crmcache/config.yaml` under the user config directory.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit_path {
      return Self::read(path);
    }

    let candidates = Self::search_paths();
    match candidates.iter().find(|path| path.is_file()) {
      Some(path) => Self::read(path),
      None => {
        let searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        Err(eyre!(
          "No configuration file found (searched {}). Set at least `directory.url`.",
          searched.join(", ")
        ))
      }
    }
  }

  fn search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("crmcache.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("crmcache").join("config.yaml")));
    paths
  }

  fn read(path: &Path) -> Result<Self> {
    let contents = match std::fs::read_to_string(path) {
      Ok(contents) => contents,
      Err(e) if e.kind() == ErrorKind::NotFound => {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      Err(e) => return Err(eyre!("Failed to read config file {}: {}", path.display(), e)),
    };
    Self::parse(&contents).map_err(|e| eyre!("Invalid config {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.directory.url.trim().is_empty() {
      return Err(eyre!("directory.url must not be empty"));
    }
    if config.cache.min_query_len == 0 {
      return Err(eyre!("cache.min_query_len must be at least 1"));
    }
    Ok(config)
  }

  /// Get the directory API token from environment variables.
  ///
  /// Checks CRMCACHE_API_TOKEN first, then CRM_API_TOKEN as fallback.
  /// Requests go out unauthenticated when neither is set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CRMCACHE_API_TOKEN")
      .or_else(|_| std::env::var("CRM_API_TOKEN"))
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("directory:\n  url: https://crm.example.com/api\n").unwrap();

    assert_eq!(config.directory.timeout_secs, 30);
    assert!(config.cache.enabled);
    assert!(config.cache.path.is_none());
    assert!(config.log_file.is_none());
    assert_eq!(config.cache.policy(), SyncPolicy::default());
  }

  #[test]
  fn test_cache_policy_overrides() {
    let config = Config::parse(
      r#"
directory:
  url: https://crm.example.com/api
  timeout_secs: 5
cache:
  enabled: false
  path: /tmp/customers.db
  trust_window_secs: 10
  min_query_len: 3
  resync_after_mins: 15
log_file: /tmp/crmcache.log
"#,
    )
    .unwrap();

    assert!(!config.cache.enabled);
    assert_eq!(config.cache.path, Some(PathBuf::from("/tmp/customers.db")));
    let policy = config.cache.policy();
    assert_eq!(policy.trust_window, chrono::Duration::seconds(10));
    assert_eq!(policy.min_query_len, 3);
    assert_eq!(policy.resync_after, chrono::Duration::minutes(15));
  }

  #[test]
  fn test_rejects_invalid_values() {
    assert!(Config::parse("directory:\n  url: \"  \"\n").is_err());
    assert!(Config::parse(
      "directory:\n  url: https://crm.example.com\ncache:\n  min_query_len: 0\n"
    )
    .is_err());
    assert!(Config::parse("cache:\n  enabled: true\n").is_err());
  }

  #[test]
  fn test_local_file_is_searched_first() {
    let paths = Config::search_paths();
    assert_eq!(paths[0], PathBuf::from("crmcache.yaml"));
    assert!(paths.iter().skip(1).all(|p| p.ends_with("crmcache/config.yaml")));
  }

  #[test]
  fn test_read_reports_path_of_invalid_file() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.yaml");
    std::fs::write(&good, "directory:\n  url: https://crm.example.com/api\n").unwrap();
    assert_eq!(Config::load(Some(good.as_path())).unwrap().directory.url, "https://crm.example.com/api");

    let bad = dir.path().join("bad.yaml");
    std::fs::write(&bad, "directory:\n  url: \"\"\n").unwrap();
    let err = Config::load(Some(bad.as_path())).unwrap_err();
    assert!(err.to_string().contains("bad.yaml"));
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
