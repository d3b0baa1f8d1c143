//! Backend node boundary.
//!
//! The aggregation engine never talks to a store directly; it walks a list
//! of [`BackendNode`] handles obtained from a [`Directory`]. How records
//! are stored, cached, or fetched over the network is entirely the
//! backend's business — the engine only sequences calls and merges results.

pub mod memory;

use std::sync::Arc;

use thiserror::Error;

use crate::model::types::{NodePath, PatternMatch, Record};

/// Failures a backend call can report.
///
/// During traversal the engine absorbs everything except
/// [`BackendError::BufferTooSmall`], which suspends the query so the caller
/// can retry with a bigger buffer: an unreachable or misbehaving node is
/// skipped, never fatal to the aggregate query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// No record of the requested name/type; equivalent to zero results.
    #[error("record not found")]
    NotFound,

    /// The node cannot be opened or stopped responding.
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// Not even one record of the current window fits the reply buffer.
    #[error("backend reply buffer too small")]
    BufferTooSmall,

    /// Anything else; treated as a skippable node failure.
    #[error("backend failure: {0}")]
    Other(String),
}

/// What to search for on a node. One shape serves both the record-list and
/// the attribute-value-search entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeQuery {
    pub kind: QueryKind,
    /// Record types to match, e.g. `users`.
    pub record_types: Vec<String>,
    /// Attribute types the caller wants back; `*` means all.
    pub requested_attrs: Vec<String>,
    /// Pack attribute types only, omitting values.
    pub attrs_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    /// Match on record names.
    RecordList {
        name_patterns: Vec<String>,
        match_mode: PatternMatch,
    },
    /// Match on one attribute's values.
    AttributeSearch {
        attr_type: String,
        value_pattern: String,
        match_mode: PatternMatch,
    },
}

impl NodeQuery {
    /// A query for all records of the given types (any name).
    pub fn all_of_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: QueryKind::RecordList {
                name_patterns: Vec::new(),
                match_mode: PatternMatch::Any,
            },
            record_types: types.into_iter().map(Into::into).collect(),
            requested_attrs: vec![crate::model::types::ATTR_ALL.to_string()],
            attrs_only: false,
        }
    }

    pub fn wants_attr(&self, attr_type: &str) -> bool {
        self.requested_attrs
            .iter()
            .any(|a| a == attr_type || a == crate::model::types::ATTR_ALL)
    }
}

/// One page of backend results plus an opaque resumption cursor. A `Some`
/// cursor means the node holds more matches beyond this page.
#[derive(Debug, Clone, Default)]
pub struct BackendPage {
    pub records: Vec<Record>,
    pub cursor: Option<u64>,
}

/// An open backend node.
pub trait BackendNode: Send + Sync {
    /// Node address this handle was opened against.
    fn path(&self) -> &NodePath;

    /// Run a query. `limit` bounds the number of records returned across
    /// the whole traversal of this node (0 = unlimited); `cursor` resumes
    /// a previous page.
    fn search(
        &self,
        query: &NodeQuery,
        limit: u32,
        cursor: Option<u64>,
    ) -> Result<BackendPage, BackendError>;
}

/// Node discovery and opening — the collaborator service the resolver and
/// the query engine share.
pub trait Directory: Send + Sync {
    /// Open a node by address.
    fn open(&self, path: &NodePath) -> Result<Arc<dyn BackendNode>, BackendError>;

    /// Local store node addresses, in search order. Never empty.
    fn local_paths(&self) -> Vec<NodePath>;

    /// Walk upward from the local node and return the enclosing
    /// hierarchical-domain chain, nearest first. `Err` means the hierarchy
    /// is not discoverable right now.
    fn hierarchy_paths(&self) -> Result<Vec<NodePath>, BackendError>;

    /// Default network directory (LDAP) node addresses.
    fn network_default_paths(&self) -> Result<Vec<NodePath>, BackendError>;
}
