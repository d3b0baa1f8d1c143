//! Turns a search policy into an ordered backend node list.
//!
//! Ordering rules, in every case: local node(s) first, configuration order
//! preserved in the middle, network directory augmentation (if enabled)
//! last. Resolution never yields an empty list — any failure degrades to
//! "local only" rather than leaving a search node with no path.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{BackendNode, Directory};
use crate::model::types::{NodePath, SearchPolicy};
use crate::policy::config_file::SearchNodeConfig;

/// Which resolution stage produced a node-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOrigin {
    Local,
    Hierarchy,
    Network,
    Custom,
}

/// One backend node in a search path. The handle is populated lazily the
/// first time traversal reaches the entry and cached for later calls on
/// the same reference.
#[derive(Clone)]
pub struct NodeListEntry {
    pub name: String,
    pub path: NodePath,
    pub origin: NodeOrigin,
    pub handle: Option<Arc<dyn BackendNode>>,
    /// Set when an open attempt failed; cleared by a successful open.
    pub open_failed: bool,
}

impl NodeListEntry {
    pub fn new(path: NodePath, origin: NodeOrigin) -> Self {
        Self {
            name: path.to_string(),
            path,
            origin,
            handle: None,
            open_failed: false,
        }
    }

    /// Copy for a new reference: same address, unopened handle.
    pub fn fresh_copy(&self) -> Self {
        Self {
            name: self.name.clone(),
            path: self.path.clone(),
            origin: self.origin,
            handle: None,
            open_failed: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }
}

impl fmt::Debug for NodeListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeListEntry")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("open", &self.is_open())
            .field("open_failed", &self.open_failed)
            .finish()
    }
}

/// Deep-copy a node list with fresh unopened handles.
pub fn fresh_copies(entries: &[NodeListEntry]) -> Vec<NodeListEntry> {
    entries.iter().map(NodeListEntry::fresh_copy).collect()
}

/// A resolved search path.
#[derive(Debug, Clone)]
pub struct ResolvedList {
    pub entries: Vec<NodeListEntry>,
    /// Hierarchy discovery failed; the query engine should re-probe it
    /// lazily while advancing nodes instead of re-resolving every call.
    pub recheck_hierarchy: bool,
}

/// Computes node lists from collaborator services. Reads shared services,
/// never mutates the config store.
pub struct SearchPathResolver {
    directory: Arc<dyn Directory>,
}

impl SearchPathResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    pub fn resolve(&self, policy: SearchPolicy, config: &SearchNodeConfig) -> ResolvedList {
        let mut entries = self.local_entries();
        let mut recheck_hierarchy = false;

        match policy {
            SearchPolicy::LocalOnly => {}
            SearchPolicy::Automatic => {
                match self.directory.hierarchy_paths() {
                    Ok(chain) => {
                        for path in chain {
                            push_unique(&mut entries, path, NodeOrigin::Hierarchy);
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "hierarchy not discoverable, degrading to local only");
                        recheck_hierarchy = true;
                    }
                }
                if config.network_defaults.enabled {
                    match self.directory.network_default_paths() {
                        Ok(paths) => {
                            for path in paths {
                                push_unique(&mut entries, path, NodeOrigin::Network);
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "network default paths unavailable");
                        }
                    }
                }
            }
            SearchPolicy::Custom => {
                for raw in &config.custom_paths {
                    push_unique(&mut entries, NodePath::parse(raw), NodeOrigin::Custom);
                }
            }
        }

        for (i, entry) in entries.iter().enumerate() {
            debug!(position = i + 1, node = %entry.name, origin = ?entry.origin, "search path node");
        }

        ResolvedList {
            entries,
            recheck_hierarchy,
        }
    }

    /// Local nodes, always the head of any resolved list. Synthesizes the
    /// default local node if enumeration comes back empty.
    fn local_entries(&self) -> Vec<NodeListEntry> {
        let mut paths = self.directory.local_paths();
        if paths.is_empty() {
            warn!("local node enumeration came back empty, synthesizing default");
            paths = vec![NodePath::parse("/local/default")];
        }
        paths
            .into_iter()
            .map(|p| NodeListEntry::new(p, NodeOrigin::Local))
            .collect()
    }
}

fn push_unique(entries: &mut Vec<NodeListEntry>, path: NodePath, origin: NodeOrigin) {
    if entries.iter().any(|e| e.path == path) {
        return;
    }
    entries.push(NodeListEntry::new(path, origin));
}
