//! Alias records and their transparent expansion.
//!
//! An alias record redirects to a record on another node. The designated
//! `alias-data` attribute carries a JSON payload naming the aliased
//! record's type, name(s), and node location. Expansion validates the
//! payload, opens the target node, and re-issues the query there; any
//! defect in an individual alias (bad payload, type mismatch, unreachable
//! target) skips that alias without failing the aggregate query.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::NodeQuery;
use crate::model::types::{
    ATTR_ALIAS_DATA, ATTR_ALL, ATTR_META_SOURCE_PATH, ATTR_META_TARGET_PATH, NodePath, Record,
    RECTYPE_GROUP_ALIASES, RECTYPE_GROUPS, RECTYPE_USER_ALIASES, RECTYPE_USERS,
};

/// Maximum transitive expansion depth per node; alias cycles are truncated
/// silently past this bound rather than failing the call.
pub const MAX_EXPANSION_DEPTH: u32 = 5;

pub const PAYLOAD_VERSION: &str = "1";

/// Queried record type → the alias record type that may shadow it.
static ALIAS_TYPE_FOR: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (RECTYPE_USERS, RECTYPE_USER_ALIASES),
        (RECTYPE_GROUPS, RECTYPE_GROUP_ALIASES),
    ])
});

/// Alias record type → the record type its payload must declare.
static TARGET_TYPE_FOR: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (RECTYPE_USER_ALIASES, RECTYPE_USERS),
        (RECTYPE_GROUP_ALIASES, RECTYPE_GROUPS),
    ])
});

/// Structured payload of an `alias-data` attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasPayload {
    pub version: String,
    /// Names the aliased record is known by; all are re-queried.
    pub names: Vec<String>,
    /// Record type of the aliased record.
    pub rec_type: String,
    /// Node the aliased record lives on.
    pub location: NodePath,
}

impl AliasPayload {
    pub fn new(
        names: Vec<String>,
        rec_type: impl Into<String>,
        location: NodePath,
    ) -> Self {
        Self {
            version: PAYLOAD_VERSION.to_string(),
            names,
            rec_type: rec_type.into(),
            location,
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("alias payload serializes")
    }
}

/// What a query registered for alias handling.
#[derive(Debug, Clone, Default)]
pub struct AliasCheck {
    /// Alias record types to fetch after direct matches (empty: none).
    pub alias_types: Vec<String>,
    /// Caller asked for the target-node-path pseudo-attribute.
    pub meta_target: bool,
    /// Caller asked for the source-node-path pseudo-attribute.
    pub meta_source: bool,
}

/// Inspect a query: which alias record types apply to the queried record
/// types, and which meta path attributes the caller wants attached.
pub fn alias_check(query: &NodeQuery) -> AliasCheck {
    let mut check = AliasCheck::default();
    for rec_type in &query.record_types {
        if let Some(alias_type) = ALIAS_TYPE_FOR.get(rec_type.as_str()) {
            if !check.alias_types.iter().any(|t| t == alias_type) {
                check.alias_types.push((*alias_type).to_string());
            }
        }
    }
    if !check.alias_types.is_empty() {
        for attr in &query.requested_attrs {
            match attr.as_str() {
                ATTR_META_TARGET_PATH => check.meta_target = true,
                ATTR_META_SOURCE_PATH => check.meta_source = true,
                ATTR_ALL => {
                    check.meta_target = true;
                    check.meta_source = true;
                }
                _ => {}
            }
        }
    }
    check
}

/// Parse the alias payload out of an alias record. `None` (with a debug
/// log) for records without a parseable payload.
pub fn parse_payload(record: &Record) -> Option<AliasPayload> {
    let attr = record.attribute(ATTR_ALIAS_DATA)?;
    let value = attr.values.first()?;
    match serde_json::from_slice::<AliasPayload>(value) {
        Ok(payload) => Some(payload),
        Err(err) => {
            debug!(record = %record.name, error = %err, "unparseable alias payload, skipping");
            None
        }
    }
}

/// An alias's declared target type must match what its own record type
/// aliases; anything else is a non-fatal skip.
pub fn payload_matches(alias_rec_type: &str, payload: &AliasPayload) -> bool {
    TARGET_TYPE_FOR
        .get(alias_rec_type)
        .is_some_and(|target| *target == payload.rec_type)
}
