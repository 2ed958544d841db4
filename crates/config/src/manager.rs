//! The configuration manager.

use crate::component::ComponentConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::section::{JsonDocument, SectionType};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How often the periodic writer persists the configuration when any
/// component signalled a change in the interval.
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(1);

struct Inner {
    /// The singular cluster component, stored apart from the sections.
    cluster: Option<Arc<dyn ComponentConfig>>,
    /// Registered components, by section and component key.
    sections: BTreeMap<SectionType, BTreeMap<String, Arc<dyn ComponentConfig>>>,
    /// Components that were absent from the loaded JSON and got defaulted.
    undefined: BTreeMap<SectionType, BTreeSet<String>>,
    /// The originally parsed document. Sections without registered
    /// components survive load/save through it.
    doc: JsonDocument,
    /// Where the document lives on disk, once known.
    path: Option<PathBuf>,
    /// Remote source URL, when the document was loaded through one.
    source: Option<String>,
}

/// Bundles the component configurations of a cluster peer into a single
/// JSON document.
///
/// Register components with [`register_component`](Manager::register_component)
/// before loading. Each registered component gets a save watcher: signalling
/// its notifier marks the configuration dirty, and a periodic writer
/// persists at most once per [`DEFAULT_SAVE_INTERVAL`], collapsing bursts.
pub struct Manager {
    inner: Mutex<Inner>,
    save_interval: Duration,
    /// Serializes the save path.
    save_mutex: Mutex<()>,
    cancel: CancellationToken,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// A manager with the default save interval.
    pub fn new() -> Arc<Self> {
        Self::with_save_interval(DEFAULT_SAVE_INTERVAL)
    }

    /// A manager with a custom save interval. Tests use short intervals.
    pub fn with_save_interval(save_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                cluster: None,
                sections: BTreeMap::new(),
                undefined: BTreeMap::new(),
                doc: JsonDocument::default(),
                path: None,
                source: None,
            }),
            save_interval,
            save_mutex: Mutex::new(()),
            cancel: CancellationToken::new(),
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Register a component configuration under a section.
    ///
    /// Must happen before loading. Idempotent per `(section, config_key)`:
    /// re-registering an already known component is a no-op.
    pub fn register_component(self: &Arc<Self>, section: SectionType, component: Arc<dyn ComponentConfig>) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match section {
                SectionType::Cluster => {
                    if inner.cluster.is_some() {
                        return;
                    }
                    inner.cluster = Some(component.clone());
                }
                other => {
                    let entry = inner.sections.entry(other).or_default();
                    if entry.contains_key(component.config_key()) {
                        return;
                    }
                    entry.insert(component.config_key().to_string(), component.clone());
                }
            }
        }
        self.spawn_save_watcher(component.save_notifier());
    }

    fn spawn_save_watcher(self: &Arc<Self>, notify: Arc<Notify>) {
        let weak: Weak<Manager> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let interval = self.save_interval;
        let handle = tokio::spawn(async move {
            watch_save(weak, notify, interval, cancel).await;
        });
        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Reset every registered component to its defaults.
    pub fn set_defaults(&self) -> ConfigResult<()> {
        let (cluster, components) = self.snapshot_components();
        for (key, component) in components {
            tracing::debug!(component = %key, "generating default configuration");
            component.set_default()?;
        }
        if let Some(cluster) = cluster {
            tracing::debug!("generating default configuration for cluster");
            cluster.set_default()?;
        }
        Ok(())
    }

    /// Overlay environment variables onto every registered component.
    pub fn apply_env_vars(&self) -> ConfigResult<()> {
        let (cluster, components) = self.snapshot_components();
        for (key, component) in components {
            tracing::debug!(component = %key, "applying environment overrides");
            component.apply_env_vars()?;
        }
        if let Some(cluster) = cluster {
            cluster.apply_env_vars()?;
        }
        Ok(())
    }

    /// Read and parse the document at `path`, populating every registered
    /// component. Remembers the path for subsequent saves.
    pub async fn load_from_file(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.path = Some(path.to_path_buf());
        }
        let bytes = std::fs::read(path).inspect_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "error reading the configuration file");
        })?;
        self.load_bytes_inner(&bytes, 0).await
    }

    /// [`load_from_file`](Self::load_from_file) followed by
    /// [`apply_env_vars`](Self::apply_env_vars).
    pub async fn load_from_file_and_env(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        self.load_from_file(path).await?;
        self.apply_env_vars()
    }

    /// Fetch the document from a URL and parse it. The fetched document must
    /// not point at yet another source.
    pub async fn load_from_url(&self, url: &str) -> ConfigResult<()> {
        tracing::info!(url, "loading configuration from remote source");
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.source = Some(url.to_string());
        }
        let body = fetch_source(url).await?;
        self.load_bytes_inner(&body, 1).await
    }

    /// Parse a document from raw bytes.
    pub async fn load_from_bytes(&self, bytes: &[u8]) -> ConfigResult<()> {
        self.load_bytes_inner(bytes, 0).await
    }

    /// Parse `bytes`, following at most one `source` redirection counted by
    /// `fetches_used`. The counter starts fresh on every top-level load.
    async fn load_bytes_inner(&self, bytes: &[u8], mut fetches_used: u32) -> ConfigResult<()> {
        let mut doc: JsonDocument = serde_json::from_slice(bytes).inspect_err(|e| {
            tracing::error!(error = %e, "error parsing configuration JSON");
        })?;

        while let Some(url) = doc.source_url().map(str::to_string) {
            if fetches_used > 0 {
                return Err(ConfigError::SourceRedirect);
            }
            fetches_used += 1;
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.source = Some(url.clone());
            }
            let body = fetch_source(&url).await?;
            doc = serde_json::from_slice(&body)?;
        }

        self.populate(doc)?;
        self.validate()
    }

    /// Hand each registered component its blob from the document, defaulting
    /// the ones the document does not mention.
    fn populate(&self, doc: JsonDocument) -> ConfigResult<()> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;
        let dir = base_dir(inner.path.as_deref());

        if let (Some(cluster), Some(raw)) = (inner.cluster.as_ref(), doc.cluster.as_ref()) {
            cluster.set_base_dir(&dir);
            cluster.load_json(raw)?;
        }

        inner.undefined.clear();
        for (&section, components) in &inner.sections {
            let raw_section = doc.section(section);
            for (key, component) in components {
                component.set_base_dir(&dir);
                match raw_section.and_then(|s| s.get(key.as_str())) {
                    Some(raw) => {
                        component.load_json(raw)?;
                        tracing::debug!(component = %key, "component configuration loaded");
                    }
                    None => {
                        tracing::debug!(component = %key, "component absent from JSON, using defaults");
                        component.set_default()?;
                        inner.undefined.entry(section).or_default().insert(key.clone());
                    }
                }
            }
        }

        inner.doc = doc;
        Ok(())
    }

    /// Check that a cluster section is registered and every component
    /// validates. Validation errors carry the failing component's key.
    pub fn validate(&self) -> ConfigResult<()> {
        let (cluster, components) = self.snapshot_components();
        let cluster = cluster.ok_or_else(|| ConfigError::Validation {
            component: "cluster".to_string(),
            reason: "no registered cluster section".to_string(),
        })?;
        cluster.validate().map_err(|e| ConfigError::Validation {
            component: "cluster".to_string(),
            reason: e.to_string(),
        })?;
        for (key, component) in components {
            component.validate().map_err(|e| ConfigError::Validation {
                component: key.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Serialize and atomically persist the document with mode 0600.
    ///
    /// With `path` set, saves there and remembers it; otherwise saves to the
    /// path of the last load. When the document was loaded through a remote
    /// source, only `{"source": url}` is written.
    pub fn save(&self, path: Option<&Path>) -> ConfigResult<()> {
        let _guard = self.save_mutex.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(path) = path {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.path = Some(path.to_path_buf());
        }
        tracing::info!("saving configuration");
        let path = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.path.clone().ok_or(ConfigError::NoSavePath)?
        };
        let json = self.to_json_string()?;
        write_atomic_0600(&path, json.as_bytes())?;
        Ok(())
    }

    /// The document as a pretty JSON string, assembled from every
    /// registered component (or `{"source": url}` for sourced documents).
    pub fn to_json_string(&self) -> ConfigResult<String> {
        self.validate()?;
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(source) = inner.source.clone() {
            let doc = JsonDocument {
                source: Some(source),
                ..JsonDocument::default()
            };
            return Ok(serde_json::to_string_pretty(&doc)?);
        }

        let dir = base_dir(inner.path.as_deref());
        let mut doc = inner.doc.clone();
        doc.source = None;
        if let Some(cluster) = &inner.cluster {
            cluster.set_base_dir(&dir);
            doc.cluster = Some(cluster.to_json()?);
        }
        for (&section, components) in &inner.sections {
            for (key, component) in components {
                component.set_base_dir(&dir);
                let raw = component.to_json()?;
                if let Some(dest) = doc.section_mut(section) {
                    dest.insert(key.clone(), raw);
                }
            }
        }
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// A printable document with every component's hidden fields redacted.
    /// Only registered components appear.
    pub fn to_display_json(&self) -> ConfigResult<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = JsonDocument::default();
        if let Some(cluster) = &inner.cluster {
            doc.cluster = Some(cluster.to_display_json()?);
        }
        for (&section, components) in &inner.sections {
            for (key, component) in components {
                let raw = component.to_display_json()?;
                if let Some(dest) = doc.section_mut(section) {
                    dest.insert(key.clone(), raw);
                }
            }
        }
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Whether the given component was present in the loaded JSON (as
    /// opposed to defaulted because the document omitted it).
    pub fn is_loaded_from_json(&self, section: SectionType, name: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        !inner
            .undefined
            .get(&section)
            .is_some_and(|s| s.contains(name))
    }

    /// Extract the raw cluster section from a configuration file without
    /// registering any components.
    pub fn cluster_section_bytes(path: impl AsRef<Path>) -> ConfigResult<Vec<u8>> {
        let bytes = std::fs::read(path.as_ref())?;
        let doc: JsonDocument = serde_json::from_slice(&bytes)?;
        let cluster = doc.cluster.ok_or_else(|| ConfigError::Validation {
            component: "cluster".to_string(),
            reason: "document has no cluster section".to_string(),
        })?;
        Ok(serde_json::to_vec(&cluster)?)
    }

    /// Stop the save watchers and wait for them to drain. Pending unsaved
    /// signals are dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let watchers: Vec<JoinHandle<()>> = {
            let mut guard = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in watchers {
            let _ = handle.await;
        }
    }

    /// Clone the registered components out of the lock so callbacks run
    /// without holding it.
    #[allow(clippy::type_complexity)]
    fn snapshot_components(
        &self,
    ) -> (
        Option<Arc<dyn ComponentConfig>>,
        Vec<(String, Arc<dyn ComponentConfig>)>,
    ) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let components = inner
            .sections
            .values()
            .flat_map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect();
        (inner.cluster.clone(), components)
    }
}

/// One save watcher per registered component: marks the configuration dirty
/// on every signal and lets the ticker collapse bursts into single writes.
/// Failed saves stay dirty and are retried on the next tick.
async fn watch_save(
    manager: Weak<Manager>,
    notify: Arc<Notify>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut dirty = false;
    loop {
        tokio::select! {
            _ = notify.notified() => {
                dirty = true;
            }
            _ = ticker.tick() => {
                if dirty {
                    let Some(manager) = manager.upgrade() else { return };
                    match manager.save(None) {
                        Ok(()) => dirty = false,
                        Err(e) => {
                            tracing::error!(error = %e, "configuration save failed, retrying next tick");
                        }
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

fn base_dir(path: Option<&Path>) -> PathBuf {
    path.and_then(|p| p.parent())
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// GET the document body, refusing redirects and non-success statuses.
async fn fetch_source(url: &str) -> ConfigResult<Vec<u8>> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ConfigError::FetchingSource {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| ConfigError::FetchingSource {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let status = resp.status();
    if status.as_u16() >= 300 {
        return Err(ConfigError::FetchingSource {
            url: url.to_string(),
            reason: format!("unsuccessful request ({})", status.as_u16()),
        });
    }
    let body = resp.bytes().await.map_err(|e| ConfigError::FetchingSource {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    Ok(body.to_vec())
}

/// Write `bytes` to `path` atomically (temp file + rename) with mode 0600.
fn write_atomic_0600(path: &Path, bytes: &[u8]) -> ConfigResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());
    let tmp = path.with_file_name(format!(".{}.tmp-{}", file_name, Uuid::new_v4()));
    std::fs::write(&tmp, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
