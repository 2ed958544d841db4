//! The `consensus` configuration section.

use crate::snapshots::MAX_SNAPSHOTS;
use capstan_config::{ComponentConfig, ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// Environment variable overriding the consensus data directory.
const ENV_DATA_DIR: &str = "CAPSTAN_RAFT_DATA_DIR";

/// Consensus engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Where the operation log and snapshots live. Relative paths resolve
    /// against the configuration file's directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Commit without a quorum. Only correct for a cluster of one; used by
    /// bootstrap and tests.
    #[serde(default)]
    pub single_peer: bool,
    /// Snapshots retained on disk; older ones and the log entries they
    /// subsume are garbage-collected.
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// Leader heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Lower bound of the randomized election timeout in milliseconds.
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomized election timeout in milliseconds.
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
    /// How long a submission waits for its commit before reporting an
    /// unknown outcome.
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("raft")
}

fn default_max_snapshots() -> usize {
    MAX_SNAPSHOTS
}

fn default_heartbeat_interval_ms() -> u64 {
    100
}

fn default_election_timeout_min_ms() -> u64 {
    500
}

fn default_election_timeout_max_ms() -> u64 {
    1000
}

fn default_commit_timeout_ms() -> u64 {
    5000
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            single_peer: false,
            max_snapshots: default_max_snapshots(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            commit_timeout_ms: default_commit_timeout_ms(),
        }
    }
}

impl RaftConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn election_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min_ms),
            Duration::from_millis(self.election_timeout_max_ms),
        )
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    /// Validate tuning invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_snapshots == 0 {
            return Err("max_snapshots must be at least 1".to_string());
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms cannot be 0".to_string());
        }
        if self.election_timeout_min_ms == 0
            || self.election_timeout_max_ms < self.election_timeout_min_ms
        {
            return Err(format!(
                "election timeout range [{}, {}] ms is invalid",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            ));
        }
        if self.election_timeout_min_ms <= self.heartbeat_interval_ms {
            return Err(
                "election_timeout_min_ms must exceed heartbeat_interval_ms".to_string(),
            );
        }
        if self.commit_timeout_ms == 0 {
            return Err("commit_timeout_ms cannot be 0".to_string());
        }
        Ok(())
    }

    /// A configuration with snappy timeouts for tests, storing data under
    /// `data_dir`.
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            single_peer: false,
            max_snapshots: default_max_snapshots(),
            heartbeat_interval_ms: 20,
            election_timeout_min_ms: 100,
            election_timeout_max_ms: 200,
            commit_timeout_ms: 2000,
        }
    }
}

/// The `consensus` section component registered with the configuration
/// manager, keyed `raft`.
pub struct RaftSection {
    inner: RwLock<RaftConfig>,
    base_dir: RwLock<Option<PathBuf>>,
    notify: Arc<Notify>,
}

impl RaftSection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(RaftConfig::default()),
            base_dir: RwLock::new(None),
            notify: Arc::new(Notify::new()),
        })
    }

    /// The current configuration with `data_dir` resolved against the
    /// configuration file's directory.
    pub fn current(&self) -> RaftConfig {
        let mut config = self.inner.read().unwrap_or_else(|e| e.into_inner()).clone();
        if config.data_dir.is_relative() {
            if let Some(base) = self
                .base_dir
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
            {
                config.data_dir = base.join(&config.data_dir);
            }
        }
        config
    }

    /// Replace the configuration in memory and signal the manager to
    /// persist it.
    pub fn update(&self, config: RaftConfig) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = config;
        self.notify.notify_one();
    }
}

impl ComponentConfig for RaftSection {
    fn config_key(&self) -> &'static str {
        "raft"
    }

    fn set_default(&self) -> ConfigResult<()> {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = RaftConfig::default();
        Ok(())
    }

    fn load_json(&self, raw: &Value) -> ConfigResult<()> {
        let parsed: RaftConfig = serde_json::from_value(raw.clone())?;
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = parsed;
        Ok(())
    }

    fn to_json(&self) -> ConfigResult<Value> {
        let config = self.inner.read().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(serde_json::to_value(config)?)
    }

    fn apply_env_vars(&self) -> ConfigResult<()> {
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    fn set_base_dir(&self, dir: &Path) {
        *self.base_dir.write().unwrap_or_else(|e| e.into_inner()) = Some(dir.to_path_buf());
    }

    fn validate(&self) -> ConfigResult<()> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .validate()
            .map_err(|reason| ConfigError::Validation {
                component: "raft".to_string(),
                reason,
            })
    }

    fn save_notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(RaftConfig::default().validate().is_ok());
        assert_eq!(RaftConfig::default().max_snapshots, 5);
        assert!(!RaftConfig::default().single_peer);
    }

    #[test]
    fn bad_election_range_is_rejected() {
        let config = RaftConfig {
            election_timeout_min_ms: 500,
            election_timeout_max_ms: 100,
            ..RaftConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_data_dir_resolves_against_base() {
        let section = RaftSection::new();
        section.set_base_dir(Path::new("/etc/capstan"));
        assert_eq!(
            section.current().data_dir,
            PathBuf::from("/etc/capstan/raft")
        );
    }

    #[test]
    fn json_defaults_fill_missing_fields() {
        let section = RaftSection::new();
        section
            .load_json(&serde_json::json!({"single_peer": true}))
            .unwrap();
        let config = section.current();
        assert!(config.single_peer);
        assert_eq!(config.heartbeat_interval_ms, 100);
    }
}
