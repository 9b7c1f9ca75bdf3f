use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tripwire_action::ExecutorConfig;
use tripwire_engine::{Credentials, WorkerConfig};

/// Process configuration, read from a JSON file.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
  /// SQLite database file. Relative paths resolve against the data directory.
  pub database: PathBuf,
  /// Partitions of the topic created for `run`.
  pub partitions: u32,
  pub worker: WorkerConfig,
  pub executor: ExecutorConfig,
  /// Handed to the event source when a worker starts.
  pub credentials: Credentials,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      database: PathBuf::from("tripwire.db"),
      partitions: 1,
      worker: WorkerConfig::default(),
      executor: ExecutorConfig::default(),
      credentials: Credentials::default(),
    }
  }
}

impl Config {
  /// Load `path` if given, else `<data_dir>/config.json` if it exists, else
  /// the defaults.
  pub fn load(path: Option<&Path>, data_dir: &Path) -> Result<Self> {
    let path = match path {
      Some(path) => path.to_path_buf(),
      None => {
        let default = data_dir.join("config.json");
        if !default.exists() {
          return Ok(Self::default());
        }
        default
      }
    };

    let content = std::fs::read_to_string(&path)
      .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
      .with_context(|| format!("failed to parse config file: {}", path.display()))
  }

  pub fn database_path(&self, data_dir: &Path) -> PathBuf {
    data_dir.join(&self.database)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_without_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(None, dir.path()).unwrap();
    assert_eq!(config.partitions, 1);
    assert_eq!(config.database_path(dir.path()), dir.path().join("tripwire.db"));
  }

  #[test]
  fn test_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.json");
    std::fs::write(
      &path,
      r#"{
        "database": "/var/lib/tripwire/state.db",
        "worker": {"topic_prefix": "events.", "max_concurrent_executions": 4},
        "credentials": {"username": "svc", "password": "secret"}
      }"#,
    )
    .unwrap();

    let config = Config::load(Some(&path), dir.path()).unwrap();
    assert_eq!(config.worker.topic("acme"), "events.acme");
    assert_eq!(config.worker.max_concurrent_executions, 4);
    assert_eq!(config.executor.default_map_concurrency, 8);
    assert_eq!(config.credentials.username.as_deref(), Some("svc"));
    assert_eq!(
      config.database_path(dir.path()),
      PathBuf::from("/var/lib/tripwire/state.db")
    );
  }

  #[test]
  fn test_missing_explicit_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("nope.json")), dir.path()).is_err());
  }
}
