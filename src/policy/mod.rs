//! Search-policy layer: per-search-node configuration persistence and the
//! resolver that turns a policy into an ordered backend node list.

pub mod config_file;
pub mod resolver;

pub use config_file::{ConfigSource, NetworkDefaults, PolicyMarker, SearchNodeConfig};
pub use resolver::{NodeListEntry, NodeOrigin, ResolvedList, SearchPathResolver};
