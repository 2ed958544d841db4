//! Section types and the on-disk document shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The sections a component configuration can belong to.
///
/// `Cluster` is special: it is singular and stored at the top level rather
/// than as a named map of components.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionType {
    Cluster,
    Consensus,
    Api,
    IpfsConnector,
    State,
    PinTracker,
    Monitor,
    Allocator,
    Informer,
    Observations,
    Datastore,
}

impl SectionType {
    /// All supported section types, cluster first.
    pub const ALL: [SectionType; 11] = [
        SectionType::Cluster,
        SectionType::Consensus,
        SectionType::Api,
        SectionType::IpfsConnector,
        SectionType::State,
        SectionType::PinTracker,
        SectionType::Monitor,
        SectionType::Allocator,
        SectionType::Informer,
        SectionType::Observations,
        SectionType::Datastore,
    ];

    /// The key this section uses in the JSON document.
    pub fn json_key(self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Consensus => "consensus",
            Self::Api => "api",
            Self::IpfsConnector => "ipfs_connector",
            Self::State => "state",
            Self::PinTracker => "pin_tracker",
            Self::Monitor => "monitor",
            Self::Allocator => "allocator",
            Self::Informer => "informer",
            Self::Observations => "observations",
            Self::Datastore => "datastore",
        }
    }
}

impl std::fmt::Display for SectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.json_key())
    }
}

/// A named map of component blobs within one section.
pub(crate) type SectionMap = BTreeMap<String, Value>;

/// The configuration document as it appears on disk.
///
/// Component blobs are kept opaque; parsing them is the owning component's
/// job. Sections without registered components survive load/save untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct JsonDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consensus: SectionMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub api: SectionMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ipfs_connector: SectionMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state: SectionMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pin_tracker: SectionMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub monitor: SectionMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocator: SectionMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub informer: SectionMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub observations: SectionMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub datastore: SectionMap,
}

impl JsonDocument {
    /// Whether the document carries a non-empty `source` field.
    pub fn source_url(&self) -> Option<&str> {
        self.source.as_deref().filter(|s| !s.is_empty())
    }

    pub fn section(&self, t: SectionType) -> Option<&SectionMap> {
        match t {
            SectionType::Cluster => None,
            SectionType::Consensus => Some(&self.consensus),
            SectionType::Api => Some(&self.api),
            SectionType::IpfsConnector => Some(&self.ipfs_connector),
            SectionType::State => Some(&self.state),
            SectionType::PinTracker => Some(&self.pin_tracker),
            SectionType::Monitor => Some(&self.monitor),
            SectionType::Allocator => Some(&self.allocator),
            SectionType::Informer => Some(&self.informer),
            SectionType::Observations => Some(&self.observations),
            SectionType::Datastore => Some(&self.datastore),
        }
    }

    pub fn section_mut(&mut self, t: SectionType) -> Option<&mut SectionMap> {
        match t {
            SectionType::Cluster => None,
            SectionType::Consensus => Some(&mut self.consensus),
            SectionType::Api => Some(&mut self.api),
            SectionType::IpfsConnector => Some(&mut self.ipfs_connector),
            SectionType::State => Some(&mut self.state),
            SectionType::PinTracker => Some(&mut self.pin_tracker),
            SectionType::Monitor => Some(&mut self.monitor),
            SectionType::Allocator => Some(&mut self.allocator),
            SectionType::Informer => Some(&mut self.informer),
            SectionType::Observations => Some(&mut self.observations),
            SectionType::Datastore => Some(&mut self.datastore),
        }
    }
}
