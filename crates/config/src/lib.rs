//! Section-based configuration management for the Capstan cluster.
//!
//! Cluster components register their configurations with a [`Manager`],
//! which parses them out of a single central JSON document, overlays
//! environment variables, validates, and persists. Components signal the
//! manager when their configuration changes; a periodic writer collapses
//! bursts of signals into at most one disk write per interval.
//!
//! The document itself may live remotely: a file whose only content is a
//! `source` URL is fetched over HTTP exactly once (a fetched document that
//! points at yet another source is refused).

pub mod component;
pub mod error;
pub mod manager;
pub mod section;

pub use component::ComponentConfig;
pub use error::{ConfigError, ConfigResult};
pub use manager::{Manager, DEFAULT_SAVE_INTERVAL};
pub use section::SectionType;
