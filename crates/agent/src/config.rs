//! The top-level `cluster` configuration section.

use capstan_config::{ComponentConfig, ConfigError, ConfigResult};
use capstan_core::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

const ENV_SECRET: &str = "CAPSTAN_CLUSTER_SECRET";
const ENV_LISTEN_ADDRESS: &str = "CAPSTAN_CLUSTER_LISTEN_ADDRESS";

/// Placeholder written in place of hidden values by the display JSON.
const HIDDEN: &str = "hidden";

/// Another member of the cluster: its identity and transport address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: PeerId,
    pub address: String,
}

/// The singular cluster section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This peer's stable identity.
    #[serde(default = "PeerId::random")]
    pub id: PeerId,
    /// Shared cluster secret, hex-encoded. Hidden from display output.
    #[serde(default)]
    pub secret: String,
    /// The other members of the cluster.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    /// Where the peer transport listens.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Maximum delay before the tracker is told to reconcile even if the
    /// consensus state is still catching up.
    #[serde(default = "default_first_sync_delay_ms")]
    pub first_sync_delay_ms: u64,
    /// How often catch-up compares the applied and last log indexes.
    #[serde(default = "default_catch_up_interval_ms")]
    pub catch_up_interval_ms: u64,
}

fn default_listen_address() -> String {
    "127.0.0.1:9096".to_string()
}

fn default_first_sync_delay_ms() -> u64 {
    10_000
}

fn default_catch_up_interval_ms() -> u64 {
    500
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: PeerId::random(),
            secret: String::new(),
            peers: Vec::new(),
            listen_address: default_listen_address(),
            first_sync_delay_ms: default_first_sync_delay_ms(),
            catch_up_interval_ms: default_catch_up_interval_ms(),
        }
    }
}

impl ClusterConfig {
    /// Identities of the other members.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.id).collect()
    }

    pub fn first_sync_delay(&self) -> Duration {
        Duration::from_millis(self.first_sync_delay_ms)
    }

    pub fn catch_up_interval(&self) -> Duration {
        Duration::from_millis(self.catch_up_interval_ms)
    }

    /// Validate identity, addresses, and the secret's shape.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_nil() {
            return Err("cluster id cannot be the nil peer id".to_string());
        }
        if !self.secret.is_empty()
            && (self.secret.len() != 64 || !self.secret.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err("cluster secret must be 64 hex characters".to_string());
        }
        if self.listen_address.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "listen_address {:?} is not a valid socket address",
                self.listen_address
            ));
        }
        if self.peers.iter().any(|p| p.id == self.id) {
            return Err("peers must not include this peer's own id".to_string());
        }
        if self.catch_up_interval_ms == 0 {
            return Err("catch_up_interval_ms cannot be 0".to_string());
        }
        Ok(())
    }

    /// A configuration with fast catch-up timings for tests.
    pub fn for_testing() -> Self {
        Self {
            first_sync_delay_ms: 2_000,
            catch_up_interval_ms: 20,
            ..Self::default()
        }
    }
}

/// The `cluster` section component registered with the configuration
/// manager.
pub struct ClusterSection {
    inner: RwLock<ClusterConfig>,
    notify: Arc<Notify>,
}

impl ClusterSection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(ClusterConfig::default()),
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn current(&self) -> ClusterConfig {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration in memory and signal the manager to
    /// persist it.
    pub fn update(&self, config: ClusterConfig) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = config;
        self.notify.notify_one();
    }
}

impl ComponentConfig for ClusterSection {
    fn config_key(&self) -> &'static str {
        "cluster"
    }

    fn set_default(&self) -> ConfigResult<()> {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = ClusterConfig::default();
        Ok(())
    }

    fn load_json(&self, raw: &Value) -> ConfigResult<()> {
        let parsed: ClusterConfig = serde_json::from_value(raw.clone())?;
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = parsed;
        Ok(())
    }

    fn to_json(&self) -> ConfigResult<Value> {
        Ok(serde_json::to_value(self.current())?)
    }

    fn to_display_json(&self) -> ConfigResult<Value> {
        let mut config = self.current();
        if !config.secret.is_empty() {
            config.secret = HIDDEN.to_string();
        }
        Ok(serde_json::to_value(config)?)
    }

    fn apply_env_vars(&self) -> ConfigResult<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Ok(secret) = std::env::var(ENV_SECRET) {
            inner.secret = secret;
        }
        if let Ok(listen) = std::env::var(ENV_LISTEN_ADDRESS) {
            inner.listen_address = listen;
        }
        Ok(())
    }

    fn set_base_dir(&self, _dir: &Path) {}

    fn validate(&self) -> ConfigResult<()> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .validate()
            .map_err(|reason| ConfigError::Validation {
                component: "cluster".to_string(),
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
        assert!(ClusterConfig::default().validate().is_ok());
    }

    #[test]
    fn malformed_secret_is_rejected() {
        let config = ClusterConfig {
            secret: "tooshort".to_string(),
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn own_id_in_peer_list_is_rejected() {
        let mut config = ClusterConfig::default();
        config.peers.push(PeerEntry {
            id: config.id,
            address: "127.0.0.1:9097".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn display_json_hides_the_secret() {
        let section = ClusterSection::new();
        let mut config = ClusterConfig::default();
        config.secret = "ab".repeat(32);
        section.update(config.clone());

        let display = section.to_display_json().unwrap();
        assert_eq!(display["secret"], HIDDEN);
        // The regular serialization keeps it for persistence.
        let json = section.to_json().unwrap();
        assert_eq!(json["secret"], config.secret);
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let section = ClusterSection::new();
        section
            .load_json(&serde_json::json!({"secret": ""}))
            .unwrap();
        let config = section.current();
        assert_eq!(config.listen_address, default_listen_address());
        assert_eq!(config.first_sync_delay_ms, 10_000);
        assert!(!config.id.is_nil());
    }
}
