//! The aggregation engine and its service facade.
//!
//! [`SearchService`] is what the transport/dispatch layer talks to: open
//! and close virtual search nodes, run paginated record queries against
//! them, decode packed reply buffers entry by entry, and administer search
//! policies through authorized custom calls.

pub mod alias;
pub mod context;
pub mod continuation;
pub mod query;
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::backend::{Directory, NodeQuery, QueryKind};
use crate::engine::context::{NodeReferenceContext, RefEntry, RefId, RefTable};
use crate::engine::continuation::{ContinuationHandle, ContinuationRegistry};
use crate::engine::query::{QueryReply, QueryRequest, QueryRuntime};
use crate::engine::store::{SearchConfig, SearchConfigStore};
use crate::error::Status;
use crate::model::types::{
    ATTR_ALL, ATTR_READ_ONLY, ATTR_SEARCH_PATH, ATTR_SEARCH_POLICY, Attribute, PatternMatch,
    RECTYPE_NODE_INFO, Record, SearchKind, SearchPolicy,
};
use crate::policy::config_file::{ConfigSource, NetworkDefaults, PolicyMarker, SearchNodeConfig};
use crate::policy::resolver::{NodeListEntry, NodeOrigin, SearchPathResolver};
use crate::wire;
use crate::wire::writer::{ResultBuffer, encode_record};

/// Where the service keeps its files.
#[derive(Debug, Clone)]
pub struct ServicePaths {
    /// Per-search-node config files.
    pub config_dir: PathBuf,
    /// Active-policy marker files.
    pub run_dir: PathBuf,
}

impl ServicePaths {
    /// Platform defaults under the project directories.
    pub fn default_paths() -> Self {
        directories::ProjectDirs::from("org", "dirsearch", "dirsearch").map_or_else(
            || Self::under(std::path::Path::new(".")),
            |dirs| Self {
                config_dir: dirs.config_dir().to_path_buf(),
                run_dir: dirs.data_local_dir().join("run"),
            },
        )
    }

    /// Everything under one root; used by tests and the demo command.
    pub fn under(root: &std::path::Path) -> Self {
        Self {
            config_dir: root.join("config"),
            run_dir: root.join("run"),
        }
    }
}

/// Validates custom-call authorization tokens.
pub trait Authorizer: Send + Sync {
    fn authorize_configure(&self, token: &[u8]) -> bool;
}

/// Accepts any token. For demos and tests.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize_configure(&self, _token: &[u8]) -> bool {
        true
    }
}

/// Rejects every token; only the root blank-token bypass applies.
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn authorize_configure(&self, _token: &[u8]) -> bool {
        false
    }
}

/// The custom-call opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomCall {
    SetPolicyAutomatic,
    SetPolicyLocalOnly,
    SetPolicyCustom,
    SetCustomNodeList,
    ReadNetworkDefaultsSize,
    ReadNetworkDefaults,
    WriteNetworkDefaults,
    ListUnreachableNodes,
}

impl CustomCall {
    pub fn from_opcode(opcode: u32) -> Option<Self> {
        match opcode {
            1 => Some(Self::SetPolicyAutomatic),
            2 => Some(Self::SetPolicyLocalOnly),
            3 => Some(Self::SetPolicyCustom),
            4 => Some(Self::SetCustomNodeList),
            5 => Some(Self::ReadNetworkDefaultsSize),
            6 => Some(Self::ReadNetworkDefaults),
            7 => Some(Self::WriteNetworkDefaults),
            8 => Some(Self::ListUnreachableNodes),
            _ => None,
        }
    }

    /// Reachability inspection is the only unauthenticated call.
    pub fn requires_auth(self) -> bool {
        !matches!(self, Self::ListUnreachableNodes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    NotInitialized,
    Ready,
    Failed,
}

/// Startup gate: operations fail until `initialize` completes, and callers
/// may block on readiness with a timeout. This is the only timeout in the
/// engine; individual backend calls are never timed out.
struct InitGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl InitGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::NotInitialized),
            cond: Condvar::new(),
        }
    }

    fn set(&self, state: GateState) {
        *self.state.lock() = state;
        self.cond.notify_all();
    }

    fn check(&self) -> Result<(), Status> {
        match *self.state.lock() {
            GateState::Ready => Ok(()),
            GateState::NotInitialized => Err(Status::NotInitialized),
            GateState::Failed => Err(Status::FailedToInitialize),
        }
    }

    fn wait_ready(&self, timeout: Duration) -> Result<(), Status> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            match *state {
                GateState::Ready => return Ok(()),
                GateState::Failed => return Err(Status::FailedToInitialize),
                GateState::NotInitialized => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return Err(Status::NotInitialized);
                    }
                }
            }
        }
    }
}

/// Parameters of a `get_record_list` call.
#[derive(Debug, Clone)]
pub struct RecordListRequest {
    pub name_patterns: Vec<String>,
    pub match_mode: PatternMatch,
    pub record_types: Vec<String>,
    pub requested_attrs: Vec<String>,
    pub attrs_only: bool,
    /// 0 = unlimited.
    pub records_limit: u32,
    pub buffer_capacity: usize,
    pub continuation: Option<ContinuationHandle>,
}

impl RecordListRequest {
    pub fn all_of_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name_patterns: Vec::new(),
            match_mode: PatternMatch::Any,
            record_types: types.into_iter().map(Into::into).collect(),
            requested_attrs: vec![ATTR_ALL.to_string()],
            attrs_only: false,
            records_limit: 0,
            buffer_capacity: 16 * 1024,
            continuation: None,
        }
    }
}

/// Parameters of an `attribute_value_search` call.
#[derive(Debug, Clone)]
pub struct AttributeSearchRequest {
    pub attr_type: String,
    pub value_pattern: String,
    pub match_mode: PatternMatch,
    pub record_types: Vec<String>,
    pub requested_attrs: Vec<String>,
    pub attrs_only: bool,
    /// 0 = unlimited.
    pub records_limit: u32,
    pub buffer_capacity: usize,
    pub continuation: Option<ContinuationHandle>,
}

/// Reply of `get_node_info`.
#[derive(Debug)]
pub struct NodeInfoReply {
    pub buffer: Vec<u8>,
    pub attr_count: u16,
    /// Cursor reference for walking the packed attributes.
    pub attr_list_ref: RefId,
}

/// Reply of `get_record_entry`.
#[derive(Debug)]
pub struct RecordEntryReply {
    pub rec_type: String,
    pub name: String,
    pub attr_count: u16,
    pub attr_list_ref: RefId,
}

/// Reply of `get_attribute_entry`.
#[derive(Debug)]
pub struct AttributeEntryReply {
    pub attr_type: String,
    pub value_count: u16,
    pub total_value_size: usize,
    pub value_list_ref: RefId,
}

/// The search-node service: dependency-injected collaborators, explicit
/// lifecycle, and the full client-facing operation table.
pub struct SearchService {
    directory: Arc<dyn Directory>,
    authorizer: Arc<dyn Authorizer>,
    resolver: SearchPathResolver,
    store: SearchConfigStore,
    refs: RefTable,
    continuations: ContinuationRegistry,
    gate: InitGate,
    marker: PolicyMarker,
    config_dir: PathBuf,
}

impl SearchService {
    pub fn new(
        directory: Arc<dyn Directory>,
        authorizer: Arc<dyn Authorizer>,
        paths: ServicePaths,
    ) -> Self {
        let resolver = SearchPathResolver::new(directory.clone());
        Self {
            directory,
            authorizer,
            resolver,
            store: SearchConfigStore::new(),
            refs: RefTable::new(),
            continuations: ContinuationRegistry::new(),
            gate: InitGate::new(),
            marker: PolicyMarker::new(paths.run_dir),
            config_dir: paths.config_dir,
        }
    }

    /// Build the three standard search configs from their config files.
    /// Safe to call again after a failure; already-installed configs are
    /// kept as they are.
    pub fn initialize(&self) -> Result<(), Status> {
        let result = self.build_configs();
        self.gate.set(if result.is_ok() {
            GateState::Ready
        } else {
            GateState::Failed
        });
        result
    }

    fn build_configs(&self) -> Result<(), Status> {
        for kind in [SearchKind::Authentication, SearchKind::Contacts] {
            if self.store.contains(kind) {
                continue;
            }
            let prefix = kind.config_prefix().expect("configurable search kind");
            let source = ConfigSource::load(&self.config_dir, prefix);
            let policy = source.policy();
            let resolved = self.resolver.resolve(policy, source.config());
            info!(
                kind = %kind,
                policy = %policy,
                nodes = resolved.entries.len(),
                "search node configured"
            );
            self.store.install(SearchConfig {
                kind,
                policy,
                node_list: resolved.entries,
                source,
                display_name: kind.node_name().to_string(),
                recheck_hierarchy: resolved.recheck_hierarchy,
            })?;
            if kind == SearchKind::Authentication {
                self.marker.set(policy);
            }
        }

        if !self.store.contains(SearchKind::Network) {
            // The network node aggregates whatever network directories are
            // registered; its list is built lazily on first open.
            let source = ConfigSource::in_memory(SearchNodeConfig {
                policy: SearchPolicy::Custom,
                ..SearchNodeConfig::default()
            });
            self.store.install(SearchConfig {
                kind: SearchKind::Network,
                policy: SearchPolicy::Custom,
                node_list: Vec::new(),
                source,
                display_name: SearchKind::Network.node_name().to_string(),
                recheck_hierarchy: false,
            })?;
        }
        Ok(())
    }

    /// Block until the service is ready, or time out with `NotInitialized`.
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<(), Status> {
        self.gate.wait_ready(timeout)
    }

    fn ready(&self) -> Result<(), Status> {
        self.gate.check()
    }

    // ---------------------------------------------------------------------
    // Reference lifecycle
    // ---------------------------------------------------------------------

    /// Open a virtual search node by its client-visible name.
    pub fn open_virtual_node(&self, name: &str, effective_uid: u32) -> Result<RefId, Status> {
        self.ready()?;
        let kind = SearchKind::from_node_name(name).ok_or(Status::InvalidReference)?;
        if kind == SearchKind::Network {
            self.ensure_network_list();
        }
        let seed = self.store.snapshot(kind).ok_or(Status::InvalidReference)?;
        let ctx = Arc::new(NodeReferenceContext::new(
            kind,
            effective_uid,
            seed.node_list,
            seed.is_automatic,
            seed.recheck_hierarchy,
        ));
        self.store.register_context(&ctx);
        let id = self.refs.insert(RefEntry::Node(ctx));
        debug!(node = name, reference = id.as_raw(), "opened virtual search node");
        Ok(id)
    }

    /// Close a reference: releases its backend handles (dropped with the
    /// context) and every continuation parked against it.
    pub fn close_virtual_node(&self, id: RefId) -> Result<(), Status> {
        self.refs.node(id)?;
        self.refs.remove(id)?;
        self.continuations.release_for_owner(id);
        debug!(reference = id.as_raw(), "closed virtual search node");
        Ok(())
    }

    fn ensure_network_list(&self) {
        let empty = self
            .store
            .with_config(SearchKind::Network, |c| c.node_list.is_empty())
            .unwrap_or(false);
        if !empty {
            return;
        }
        let Ok(paths) = self.directory.network_default_paths() else {
            return;
        };
        if paths.is_empty() {
            return;
        }
        let entries: Vec<NodeListEntry> = paths
            .into_iter()
            .map(|p| NodeListEntry::new(p, NodeOrigin::Network))
            .collect();
        self.store
            .replace_node_list(SearchKind::Network, entries, false);
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn get_record_list(
        &self,
        id: RefId,
        req: &RecordListRequest,
    ) -> Result<QueryReply, Status> {
        let query = NodeQuery {
            kind: QueryKind::RecordList {
                name_patterns: req.name_patterns.clone(),
                match_mode: req.match_mode,
            },
            record_types: req.record_types.clone(),
            requested_attrs: req.requested_attrs.clone(),
            attrs_only: req.attrs_only,
        };
        self.run_query(
            id,
            query,
            req.buffer_capacity,
            req.records_limit,
            req.continuation,
        )
    }

    pub fn attribute_value_search(
        &self,
        id: RefId,
        req: &AttributeSearchRequest,
    ) -> Result<QueryReply, Status> {
        let query = NodeQuery {
            kind: QueryKind::AttributeSearch {
                attr_type: req.attr_type.clone(),
                value_pattern: req.value_pattern.clone(),
                match_mode: req.match_mode,
            },
            record_types: req.record_types.clone(),
            requested_attrs: req.requested_attrs.clone(),
            attrs_only: req.attrs_only,
        };
        self.run_query(
            id,
            query,
            req.buffer_capacity,
            req.records_limit,
            req.continuation,
        )
    }

    fn run_query(
        &self,
        id: RefId,
        query: NodeQuery,
        buffer_capacity: usize,
        records_limit: u32,
        continuation: Option<ContinuationHandle>,
    ) -> Result<QueryReply, Status> {
        self.ready()?;
        let ctx = self.refs.node(id)?;
        let mut guard =
            self.store
                .begin_query(id, &ctx, continuation.is_some(), &self.continuations)?;
        let runtime = QueryRuntime {
            directory: &self.directory,
            store: &self.store,
            continuations: &self.continuations,
            resolver: &self.resolver,
        };
        let req = QueryRequest {
            query,
            buffer_capacity,
            records_limit,
            continuation,
        };
        runtime.run(id, &ctx, &mut guard, &req)
    }

    /// Report the reference's current search path, policy, and read-only
    /// flag as one packed pseudo-record.
    pub fn get_node_info(
        &self,
        id: RefId,
        requested: &[String],
        buffer_capacity: usize,
    ) -> Result<NodeInfoReply, Status> {
        self.ready()?;
        let ctx = self.refs.node(id)?;
        let guard = self
            .store
            .begin_query(id, &ctx, false, &self.continuations)?;
        let policy = self
            .store
            .with_config(ctx.kind, |c| c.policy)
            .ok_or(Status::InvalidReference)?;

        let wants =
            |attr: &str| requested.is_empty() || requested.iter().any(|r| r == attr || r == ATTR_ALL);
        let mut record = Record::new(RECTYPE_NODE_INFO, ctx.kind.node_name());
        if wants(ATTR_SEARCH_PATH) {
            record = record.with_attribute(
                Attribute::new(ATTR_SEARCH_PATH)
                    .with_values(guard.node_list.iter().map(|e| e.name.clone())),
            );
        }
        if wants(ATTR_SEARCH_POLICY) {
            record = record
                .with_attribute(Attribute::new(ATTR_SEARCH_POLICY).with_value(policy.label()));
        }
        if wants(ATTR_READ_ONLY) {
            record = record.with_attribute(Attribute::new(ATTR_READ_ONLY).with_value("true"));
        }
        drop(guard);

        let mut out = ResultBuffer::new(buffer_capacity);
        out.add_block(&encode_record(&record, false))
            .map_err(|_| Status::BufferTooSmall { continuation: None })?;
        let buffer = out.into_bytes();
        let info = wire::cursor::record_entry(&buffer, 1)?;
        let attr_list_ref = self.refs.insert(RefEntry::AttrList(info.attr_list_offset));
        Ok(NodeInfoReply {
            buffer,
            attr_count: info.attr_count,
            attr_list_ref,
        })
    }

    // ---------------------------------------------------------------------
    // Packed-buffer entry access
    // ---------------------------------------------------------------------

    pub fn get_record_entry(
        &self,
        buffer: &[u8],
        index: u32,
    ) -> Result<RecordEntryReply, Status> {
        let info = wire::cursor::record_entry(buffer, index)?;
        let attr_list_ref = self.refs.insert(RefEntry::AttrList(info.attr_list_offset));
        Ok(RecordEntryReply {
            rec_type: info.rec_type,
            name: info.name,
            attr_count: info.attr_count,
            attr_list_ref,
        })
    }

    pub fn get_attribute_entry(
        &self,
        attr_list_ref: RefId,
        buffer: &[u8],
        index: u32,
    ) -> Result<AttributeEntryReply, Status> {
        let offset = self.refs.attr_list_offset(attr_list_ref)?;
        let info = wire::cursor::attribute_entry(buffer, offset, index)?;
        let value_list_ref = self.refs.insert(RefEntry::ValueList(info.value_list_offset));
        Ok(AttributeEntryReply {
            attr_type: info.attr_type,
            value_count: info.value_count,
            total_value_size: info.total_value_size,
            value_list_ref,
        })
    }

    pub fn get_attribute_value(
        &self,
        value_list_ref: RefId,
        buffer: &[u8],
        index: u32,
    ) -> Result<Vec<u8>, Status> {
        let offset = self.refs.value_list_offset(value_list_ref)?;
        Ok(wire::cursor::attribute_value(buffer, offset, index)?)
    }

    pub fn close_attribute_list(&self, id: RefId) -> Result<(), Status> {
        self.refs.attr_list_offset(id)?;
        self.refs.remove(id).map(|_| ())
    }

    pub fn close_attribute_value_list(&self, id: RefId) -> Result<(), Status> {
        self.refs.value_list_offset(id)?;
        self.refs.remove(id).map(|_| ())
    }

    /// Explicitly release a parked continuation.
    pub fn release_continuation(&self, handle: ContinuationHandle) -> Result<(), Status> {
        self.continuations.release(handle)
    }

    // ---------------------------------------------------------------------
    // Custom calls
    // ---------------------------------------------------------------------

    /// Administrative calls: switch policy, replace the custom node list,
    /// read/write the network-defaults blob, list unreachable nodes.
    pub fn custom_call(
        &self,
        id: RefId,
        opcode: u32,
        auth_token: &[u8],
        blob: &[u8],
    ) -> Result<Vec<u8>, Status> {
        self.ready()?;
        let ctx = self.refs.node(id)?;
        // The network search node has no administerable policy.
        if ctx.kind == SearchKind::Network {
            return Err(Status::InvalidReference);
        }
        let call = CustomCall::from_opcode(opcode).ok_or(Status::InvalidRequest)?;
        if call.requires_auth() {
            self.check_auth(&ctx, auth_token)?;
        }

        match call {
            CustomCall::SetPolicyAutomatic => self.switch(ctx.kind, SearchPolicy::Automatic),
            CustomCall::SetPolicyLocalOnly => self.switch(ctx.kind, SearchPolicy::LocalOnly),
            CustomCall::SetPolicyCustom => self.switch(ctx.kind, SearchPolicy::Custom),
            CustomCall::SetCustomNodeList => {
                let paths: Vec<String> =
                    serde_json::from_slice(blob).map_err(|_| Status::InvalidRequest)?;
                let active = self.store.set_custom_paths(ctx.kind, paths)?;
                if active == SearchPolicy::Custom {
                    // Changes to the list only take effect through a
                    // re-switch of the active custom policy.
                    self.switch(ctx.kind, SearchPolicy::Custom)?;
                }
                Ok(Vec::new())
            }
            CustomCall::ReadNetworkDefaultsSize => {
                let blob = self.network_defaults_blob(ctx.kind)?;
                Ok((blob.len() as u32).to_ne_bytes().to_vec())
            }
            CustomCall::ReadNetworkDefaults => self.network_defaults_blob(ctx.kind),
            CustomCall::WriteNetworkDefaults => {
                let defaults: NetworkDefaults =
                    serde_json::from_slice(blob).map_err(|_| Status::InvalidRequest)?;
                let active = self.store.set_network_defaults(ctx.kind, defaults)?;
                // Re-resolve under the current policy to pick the change up.
                self.switch(ctx.kind, active)?;
                Ok(Vec::new())
            }
            CustomCall::ListUnreachableNodes => self.list_unreachable_nodes(),
        }
    }

    fn switch(&self, kind: SearchKind, policy: SearchPolicy) -> Result<Vec<u8>, Status> {
        self.store
            .switch_policy(kind, policy, &self.resolver, &self.marker)?;
        Ok(Vec::new())
    }

    fn network_defaults_blob(&self, kind: SearchKind) -> Result<Vec<u8>, Status> {
        let defaults = self.store.network_defaults(kind)?;
        serde_json::to_vec(&defaults).map_err(|_| Status::InvalidRequest)
    }

    /// Probe every non-local node on the Authentication and Contacts paths
    /// and report the ones that do not open, as a JSON list of names.
    fn list_unreachable_nodes(&self) -> Result<Vec<u8>, Status> {
        let mut candidates = Vec::new();
        for kind in [SearchKind::Authentication, SearchKind::Contacts] {
            self.store.with_config(kind, |config| {
                for entry in &config.node_list {
                    if entry.origin != NodeOrigin::Local
                        && !candidates.iter().any(|(p, _)| *p == entry.path)
                    {
                        candidates.push((entry.path.clone(), entry.name.clone()));
                    }
                }
            });
        }
        // Probe outside the store mutex; opens may block on I/O.
        let unreachable: Vec<String> = candidates
            .into_iter()
            .filter(|(path, _)| self.directory.open(path).is_err())
            .map(|(_, name)| name)
            .collect();
        debug!(count = unreachable.len(), "unreachable search path nodes");
        serde_json::to_vec(&unreachable).map_err(|_| Status::InvalidRequest)
    }

    fn check_auth(&self, ctx: &NodeReferenceContext, token: &[u8]) -> Result<(), Status> {
        // Root may present a blank token; everyone else goes through the
        // authorizer.
        if ctx.effective_uid == 0 && token.iter().all(|b| *b == 0) {
            return Ok(());
        }
        if self.authorizer.authorize_configure(token) {
            Ok(())
        } else {
            Err(Status::PermissionDenied)
        }
    }

    /// Current policy of a search node, mainly for inspection.
    pub fn policy_of(&self, kind: SearchKind) -> Option<SearchPolicy> {
        self.store.with_config(kind, |c| c.policy)
    }
}
