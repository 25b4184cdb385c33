//! Runtime configuration.
//!
//! Defaults apply to any query definition that does not set its own TTL
//! or poll interval. Configuration can be built in code or loaded from a
//! YAML file.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("failed to parse config file {path}: {source}")]
  Parse {
    path: String,
    source: serde_yaml::Error,
  },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
  /// Entry TTL when the query definition sets none. Also the idle window
  /// before an unsubscribed entry is evicted.
  #[serde(default = "default_ttl_ms")]
  pub default_ttl_ms: u64,
  /// Poll interval applied to every query when set. Most deployments
  /// leave this unset and opt in per definition.
  #[serde(default)]
  pub default_poll_interval_ms: Option<u64>,
}

fn default_ttl_ms() -> u64 {
  // 5 minutes
  300_000
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: default_ttl_ms(),
      default_poll_interval_ms: None,
    }
  }
}

impl RuntimeConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }

  pub fn default_poll_interval(&self) -> Option<Duration> {
    self.default_poll_interval_ms.map(Duration::from_millis)
  }

  /// Load configuration from a YAML file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.display().to_string(),
      source,
    })?;

    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
      path: path.display().to_string(),
      source,
    })
  }
}
