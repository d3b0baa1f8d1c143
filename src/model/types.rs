//! Core data model: node paths, records, search kinds and policies.
//!
//! Everything here is plain data. The engine, the wire codec, and the
//! backend boundary all speak these types; none of them owns behavior
//! beyond parsing/formatting helpers.

use serde::{Deserialize, Serialize};
use std::fmt;

// Well-known record types.
pub const RECTYPE_USERS: &str = "users";
pub const RECTYPE_GROUPS: &str = "groups";
pub const RECTYPE_USER_ALIASES: &str = "user-aliases";
pub const RECTYPE_GROUP_ALIASES: &str = "group-aliases";
/// Pseudo record type used by node-info replies.
pub const RECTYPE_NODE_INFO: &str = "node-info";

// Well-known attribute types.
/// Attribute on an alias record carrying the serialized alias payload.
pub const ATTR_ALIAS_DATA: &str = "alias-data";
/// Pseudo-attribute: path of the node an alias resolved to.
pub const ATTR_META_TARGET_PATH: &str = "meta:target-node-path";
/// Pseudo-attribute: path of the node the alias record itself lives on.
pub const ATTR_META_SOURCE_PATH: &str = "meta:source-node-path";
/// Node-info attribute: the resolved search path, one value per node.
pub const ATTR_SEARCH_PATH: &str = "search-path";
/// Node-info attribute: the active search policy.
pub const ATTR_SEARCH_POLICY: &str = "search-policy";
/// Node-info attribute: whether the virtual node is read-only.
pub const ATTR_READ_ONLY: &str = "read-only";
/// Wildcard requesting every attribute.
pub const ATTR_ALL: &str = "*";

/// A slash-separated directory node address, e.g. `/local/default`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath {
    segments: Vec<String>,
}

impl NodePath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse from a `/seg/seg` string. Empty segments are dropped, so
    /// `"/local//default"` and `"/local/default"` are the same path.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// First segment, used to classify the backing store family.
    pub fn root(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

/// The three virtual search nodes the service exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchKind {
    Authentication,
    Contacts,
    Network,
}

impl SearchKind {
    /// Client-visible name of the virtual node.
    pub fn node_name(self) -> &'static str {
        match self {
            SearchKind::Authentication => "/search",
            SearchKind::Contacts => "/search/contacts",
            SearchKind::Network => "/search/network",
        }
    }

    /// Config file prefix; the Network node keeps no file of its own.
    pub fn config_prefix(self) -> Option<&'static str> {
        match self {
            SearchKind::Authentication => Some("authentication"),
            SearchKind::Contacts => Some("contacts"),
            SearchKind::Network => None,
        }
    }

    pub fn from_node_name(name: &str) -> Option<Self> {
        match name {
            "/search" => Some(SearchKind::Authentication),
            "/search/contacts" => Some(SearchKind::Contacts),
            "/search/network" => Some(SearchKind::Network),
            _ => None,
        }
    }
}

impl fmt::Display for SearchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.node_name())
    }
}

/// How a virtual node's backend list is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchPolicy {
    Automatic,
    LocalOnly,
    Custom,
}

impl SearchPolicy {
    /// Stable index used by the on-disk policy marker file.
    pub fn marker_index(self) -> u32 {
        match self {
            SearchPolicy::Automatic => 1,
            SearchPolicy::LocalOnly => 2,
            SearchPolicy::Custom => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SearchPolicy::Automatic => "automatic",
            SearchPolicy::LocalOnly => "local-only",
            SearchPolicy::Custom => "custom",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "automatic" => Some(SearchPolicy::Automatic),
            "local-only" => Some(SearchPolicy::LocalOnly),
            "custom" => Some(SearchPolicy::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for SearchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Name/value matching mode for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternMatch {
    Exact,
    Prefix,
    Contains,
    Any,
}

impl PatternMatch {
    pub fn matches(self, pattern: &str, candidate: &str) -> bool {
        match self {
            PatternMatch::Exact => candidate == pattern,
            PatternMatch::Prefix => candidate.starts_with(pattern),
            PatternMatch::Contains => candidate.contains(pattern),
            PatternMatch::Any => true,
        }
    }
}

/// One attribute with its values. Values are raw bytes on the wire; most
/// backends store UTF-8 text but the engine never assumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(attr_type: impl Into<String>) -> Self {
        Self {
            attr_type: attr_type.into(),
            values: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.values.push(value.into());
        self
    }

    pub fn with_values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        self.values.extend(values.into_iter().map(Into::into));
        self
    }
}

/// One directory record as returned by a backend node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rec_type: String,
    pub name: String,
    pub attributes: Vec<Attribute>,
}

impl Record {
    pub fn new(rec_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            rec_type: rec_type.into(),
            name: name.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }

    pub fn attribute(&self, attr_type: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }
}
