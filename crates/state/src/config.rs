//! The `state` configuration section.

use capstan_config::{ComponentConfig, ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;

/// Environment variable selecting the state backend.
const ENV_STATE_BACKEND: &str = "CAPSTAN_STATE_BACKEND";

/// Which pin-set implementation backs the shared state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StateBackendConfig {
    /// In-memory pin set, persisted only through consensus snapshots.
    #[default]
    Memory,
}

impl StateBackendConfig {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// The `state` section component registered with the configuration manager.
pub struct StateSection {
    inner: RwLock<StateBackendConfig>,
    notify: Arc<Notify>,
}

impl StateSection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StateBackendConfig::default()),
            notify: Arc::new(Notify::new()),
        })
    }

    /// The currently configured backend.
    pub fn current(&self) -> StateBackendConfig {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl ComponentConfig for StateSection {
    fn config_key(&self) -> &'static str {
        "pinset"
    }

    fn set_default(&self) -> ConfigResult<()> {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = StateBackendConfig::default();
        Ok(())
    }

    fn load_json(&self, raw: &Value) -> ConfigResult<()> {
        let parsed: StateBackendConfig = serde_json::from_value(raw.clone())?;
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = parsed;
        Ok(())
    }

    fn to_json(&self) -> ConfigResult<Value> {
        Ok(serde_json::to_value(self.current())?)
    }

    fn apply_env_vars(&self) -> ConfigResult<()> {
        if let Ok(name) = std::env::var(ENV_STATE_BACKEND) {
            let backend =
                StateBackendConfig::from_name(&name).ok_or_else(|| ConfigError::Validation {
                    component: self.config_key().to_string(),
                    reason: format!("{ENV_STATE_BACKEND} names unknown backend {name:?}"),
                })?;
            *self.inner.write().unwrap_or_else(|e| e.into_inner()) = backend;
        }
        Ok(())
    }

    fn set_base_dir(&self, _dir: &Path) {}

    fn validate(&self) -> ConfigResult<()> {
        Ok(())
    }

    fn save_notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}
