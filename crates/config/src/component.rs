//! The component configuration contract.

use crate::error::ConfigResult;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;

/// A component configuration managed as one entry of the central
/// configuration document.
///
/// Implementations hold their parsed fields behind interior mutability so
/// the [`Manager`](crate::Manager) can drive them through shared references.
/// The component keeps ownership of its configuration; the manager only
/// moves JSON in and out.
pub trait ComponentConfig: Send + Sync + 'static {
    /// Name identifying this component inside its section.
    fn config_key(&self) -> &'static str;

    /// Reset to default working values.
    fn set_default(&self) -> ConfigResult<()>;

    /// Parse this component's section blob.
    fn load_json(&self, raw: &Value) -> ConfigResult<()>;

    /// JSON representation of the current configuration.
    fn to_json(&self) -> ConfigResult<Value>;

    /// Like [`to_json`](Self::to_json) but with hidden fields (credentials)
    /// redacted. Components without hidden fields inherit the default.
    fn to_display_json(&self) -> ConfigResult<Value> {
        self.to_json()
    }

    /// Overlay values from this component's recognized environment
    /// variables. Naming and precedence are component-local.
    fn apply_env_vars(&self) -> ConfigResult<()>;

    /// Base directory for resolving relative paths, set before load and
    /// before save.
    fn set_base_dir(&self, dir: &Path);

    /// Check that the configuration is usable.
    fn validate(&self) -> ConfigResult<()>;

    /// Signal source the manager watches to know this component wants its
    /// configuration persisted.
    fn save_notifier(&self) -> Arc<Notify>;
}
