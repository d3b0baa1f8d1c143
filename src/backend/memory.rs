//! In-memory `Directory`/`BackendNode` implementation.
//!
//! Used by the integration tests and the `demo` CLI command. Beyond plain
//! record storage it supports the failure shapes the engine has to cope
//! with: unreachable nodes, bounded page sizes, forced buffer-too-small
//! errors, and a hierarchy that appears only after initial resolution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::backend::{BackendError, BackendNode, BackendPage, Directory, NodeQuery, QueryKind};
use crate::model::types::{ATTR_ALL, Attribute, NodePath, Record};

/// A single in-memory node.
pub struct MemoryNode {
    path: NodePath,
    records: RwLock<Vec<Record>>,
    /// Cap on records per returned page; `None` returns everything at once.
    page_size: RwLock<Option<usize>>,
    fail_next_with_buffer_too_small: AtomicBool,
}

impl MemoryNode {
    fn new(path: NodePath) -> Self {
        Self {
            path,
            records: RwLock::new(Vec::new()),
            page_size: RwLock::new(None),
            fail_next_with_buffer_too_small: AtomicBool::new(false),
        }
    }

    pub fn add_record(&self, record: Record) {
        self.records.write().push(record);
    }

    pub fn set_page_size(&self, page_size: Option<usize>) {
        *self.page_size.write() = page_size;
    }

    /// Make the next search call fail with `BufferTooSmall` once.
    pub fn fail_next_search_with_buffer_too_small(&self) {
        self.fail_next_with_buffer_too_small
            .store(true, Ordering::SeqCst);
    }

    fn matching(&self, query: &NodeQuery) -> Vec<Record> {
        let records = self.records.read();
        records
            .iter()
            .filter(|rec| query.record_types.iter().any(|t| *t == rec.rec_type))
            .filter(|rec| match &query.kind {
                QueryKind::RecordList {
                    name_patterns,
                    match_mode,
                } => {
                    name_patterns.is_empty()
                        || name_patterns.iter().any(|p| match_mode.matches(p, &rec.name))
                }
                QueryKind::AttributeSearch {
                    attr_type,
                    value_pattern,
                    match_mode,
                } => rec.attribute(attr_type).is_some_and(|attr| {
                    attr.values.iter().any(|v| {
                        std::str::from_utf8(v)
                            .is_ok_and(|s| match_mode.matches(value_pattern, s))
                    })
                }),
            })
            .map(|rec| project(rec, query))
            .collect()
    }
}

/// Keep only the attributes the query asked for.
fn project(rec: &Record, query: &NodeQuery) -> Record {
    if query.requested_attrs.iter().any(|a| a == ATTR_ALL) {
        return rec.clone();
    }
    let attributes: Vec<Attribute> = rec
        .attributes
        .iter()
        .filter(|a| query.requested_attrs.iter().any(|r| *r == a.attr_type))
        .cloned()
        .collect();
    Record {
        rec_type: rec.rec_type.clone(),
        name: rec.name.clone(),
        attributes,
    }
}

impl BackendNode for MemoryNode {
    fn path(&self) -> &NodePath {
        &self.path
    }

    fn search(
        &self,
        query: &NodeQuery,
        limit: u32,
        cursor: Option<u64>,
    ) -> Result<BackendPage, BackendError> {
        if self
            .fail_next_with_buffer_too_small
            .swap(false, Ordering::SeqCst)
        {
            return Err(BackendError::BufferTooSmall);
        }

        let matches = self.matching(query);
        let start = cursor.unwrap_or(0) as usize;
        if start >= matches.len() {
            return Ok(BackendPage::default());
        }

        // The limit is what the caller still wants, counted from the cursor.
        let mut take = matches.len() - start;
        if limit != 0 {
            take = take.min(limit as usize);
        }
        take = take.min((*self.page_size.read()).unwrap_or(usize::MAX));

        let end = start + take;
        let next = (end < matches.len()).then_some(end as u64);
        Ok(BackendPage {
            records: matches[start..end].to_vec(),
            cursor: next,
        })
    }
}

struct DirectoryState {
    nodes: HashMap<NodePath, Arc<MemoryNode>>,
    local: Vec<NodePath>,
    hierarchy: Option<Vec<NodePath>>,
    network_defaults: Vec<NodePath>,
    unreachable: HashSet<NodePath>,
}

/// In-memory node discovery service.
pub struct MemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        let dir = Self {
            state: RwLock::new(DirectoryState {
                nodes: HashMap::new(),
                local: vec![
                    NodePath::parse("/local/default"),
                    NodePath::parse("/local/files"),
                ],
                hierarchy: None,
                network_defaults: Vec::new(),
                unreachable: HashSet::new(),
            }),
        };
        for path in dir.local_paths() {
            dir.ensure_node(&path);
        }
        dir
    }

    /// Get or create the node at `path`.
    pub fn ensure_node(&self, path: &NodePath) -> Arc<MemoryNode> {
        let mut state = self.state.write();
        state
            .nodes
            .entry(path.clone())
            .or_insert_with(|| Arc::new(MemoryNode::new(path.clone())))
            .clone()
    }

    pub fn node(&self, path: &NodePath) -> Option<Arc<MemoryNode>> {
        self.state.read().nodes.get(path).cloned()
    }

    /// First local node (`/local/default`).
    pub fn local_node(&self) -> Arc<MemoryNode> {
        let path = self.local_paths()[0].clone();
        self.ensure_node(&path)
    }

    /// Replace the local node enumeration (fixtures with one local node).
    pub fn set_local_paths(&self, paths: Vec<NodePath>) {
        for path in &paths {
            self.ensure_node(path);
        }
        self.state.write().local = paths;
    }

    pub fn set_hierarchy(&self, chain: Option<Vec<NodePath>>) {
        if let Some(chain) = &chain {
            for path in chain {
                self.ensure_node(path);
            }
        }
        self.state.write().hierarchy = chain;
    }

    pub fn set_network_defaults(&self, paths: Vec<NodePath>) {
        for path in &paths {
            self.ensure_node(path);
        }
        self.state.write().network_defaults = paths;
    }

    /// Mark a node as failing to open.
    pub fn set_unreachable(&self, path: &NodePath, unreachable: bool) {
        let mut state = self.state.write();
        if unreachable {
            state.unreachable.insert(path.clone());
        } else {
            state.unreachable.remove(path);
        }
    }
}

impl Directory for MemoryDirectory {
    fn open(&self, path: &NodePath) -> Result<Arc<dyn BackendNode>, BackendError> {
        let state = self.state.read();
        if state.unreachable.contains(path) {
            return Err(BackendError::Unreachable(path.to_string()));
        }
        state
            .nodes
            .get(path)
            .cloned()
            .map(|n| n as Arc<dyn BackendNode>)
            .ok_or_else(|| BackendError::Unreachable(path.to_string()))
    }

    fn local_paths(&self) -> Vec<NodePath> {
        self.state.read().local.clone()
    }

    fn hierarchy_paths(&self) -> Result<Vec<NodePath>, BackendError> {
        self.state
            .read()
            .hierarchy
            .clone()
            .ok_or_else(|| BackendError::Unreachable("hierarchy not discoverable".into()))
    }

    fn network_default_paths(&self) -> Result<Vec<NodePath>, BackendError> {
        Ok(self.state.read().network_defaults.clone())
    }
}
