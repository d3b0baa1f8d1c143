//! Shared search-node configuration store.
//!
//! One `SearchConfig` per search kind, all behind a single mutex.
//!
//! Lock ordering: when both the store mutex and a reference-context mutex
//! are needed, the store mutex is acquired first — [`begin_query`] is the
//! only place that takes both, and it is the required entry point for a
//! query call. The switch path never touches a context mutex at all: it
//! notifies contexts through their atomic `list_changed` flag, which is
//! what makes the ordering deadlock-free even though the query engine may
//! briefly take the store mutex mid-traversal (hierarchy re-probe) while
//! its own context is locked.
//!
//! The store mutex is held to read/copy a config or install a new node
//! list, and across the whole replace-and-notify sequence of a policy
//! switch so switches appear atomic to new opens. It is never held across
//! a backend record query.
//!
//! [`begin_query`]: SearchConfigStore::begin_query

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::engine::context::{ContextState, NodeReferenceContext, RefId};
use crate::engine::continuation::ContinuationRegistry;
use crate::error::Status;
use crate::model::types::{SearchKind, SearchPolicy};
use crate::policy::config_file::{ConfigSource, NetworkDefaults, PolicyMarker};
use crate::policy::resolver::{NodeListEntry, SearchPathResolver, fresh_copies};

/// Everything the service knows about one virtual search node.
pub struct SearchConfig {
    pub kind: SearchKind,
    pub policy: SearchPolicy,
    pub node_list: Vec<NodeListEntry>,
    pub source: ConfigSource,
    pub display_name: String,
    /// Hierarchy discovery failed at resolution; re-probed lazily.
    pub recheck_hierarchy: bool,
}

/// Outcome of a policy switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchOutcome {
    /// The resolved Authentication search path actually changed.
    pub auth_path_changed: bool,
}

/// Seed for a freshly opened reference: a deep copy of the current list.
pub struct ContextSeed {
    pub node_list: Vec<NodeListEntry>,
    pub is_automatic: bool,
    pub recheck_hierarchy: bool,
}

struct StoreInner {
    configs: HashMap<SearchKind, SearchConfig>,
    contexts: Vec<Weak<NodeReferenceContext>>,
    /// Concatenated node names of the Authentication path, for detecting
    /// switches that do not actually change the resolved path.
    auth_path_check: Option<String>,
}

/// Globally shared, mutex-guarded store of search configs plus the set of
/// live reference contexts derived from them.
pub struct SearchConfigStore {
    inner: Mutex<StoreInner>,
}

impl Default for SearchConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchConfigStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                configs: HashMap::new(),
                contexts: Vec::new(),
                auth_path_check: None,
            }),
        }
    }

    /// Install a new config; fails if the kind is already present.
    pub fn install(&self, config: SearchConfig) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        if inner.configs.contains_key(&config.kind) {
            return Err(Status::InvalidRequest);
        }
        if config.kind == SearchKind::Authentication {
            inner.auth_path_check = Some(path_check(&config.node_list));
        }
        inner.configs.insert(config.kind, config);
        Ok(())
    }

    pub fn contains(&self, kind: SearchKind) -> bool {
        self.inner.lock().configs.contains_key(&kind)
    }

    /// Read access to a config under the store mutex.
    pub fn with_config<R>(
        &self,
        kind: SearchKind,
        f: impl FnOnce(&SearchConfig) -> R,
    ) -> Option<R> {
        let inner = self.inner.lock();
        inner.configs.get(&kind).map(f)
    }

    /// Deep-copy the current node list for a new reference.
    pub fn snapshot(&self, kind: SearchKind) -> Option<ContextSeed> {
        let inner = self.inner.lock();
        inner.configs.get(&kind).map(|config| ContextSeed {
            node_list: fresh_copies(&config.node_list),
            is_automatic: config.policy == SearchPolicy::Automatic,
            recheck_hierarchy: config.recheck_hierarchy,
        })
    }

    /// Track a context so policy switches can notify it.
    pub fn register_context(&self, ctx: &Arc<NodeReferenceContext>) {
        let mut inner = self.inner.lock();
        inner.contexts.retain(|w| w.strong_count() > 0);
        inner.contexts.push(Arc::downgrade(ctx));
    }

    /// Switch a search node's policy: re-resolve the node list, replace it,
    /// persist the new policy, and flag every derived context. The whole
    /// sequence runs under the store mutex.
    pub fn switch_policy(
        &self,
        kind: SearchKind,
        policy: SearchPolicy,
        resolver: &SearchPathResolver,
        marker: &PolicyMarker,
    ) -> Result<SwitchOutcome, Status> {
        let mut inner = self.inner.lock();
        let config = inner.configs.get_mut(&kind).ok_or(Status::InvalidReference)?;

        info!(kind = %kind, policy = %policy, "switching search policy");
        let resolved = resolver.resolve(policy, config.source.config());
        let mut new_list = resolved.entries;
        carry_reachability(&config.node_list, &mut new_list);

        config.policy = policy;
        config.node_list = new_list;
        config.recheck_hierarchy = resolved.recheck_hierarchy;
        config.source.set_policy(policy);
        if let Err(err) = config.source.save() {
            warn!(error = %err, "could not persist search policy");
        }
        if kind == SearchKind::Authentication {
            marker.set(policy);
        }
        let new_check =
            (kind == SearchKind::Authentication).then(|| path_check(&config.node_list));

        let auth_path_changed = match new_check {
            Some(check) => {
                let changed = inner.auth_path_check.as_deref() != Some(check.as_str());
                inner.auth_path_check = Some(check);
                changed
            }
            None => false,
        };

        Self::notify_contexts(&mut *inner, kind);
        Ok(SwitchOutcome { auth_path_changed })
    }

    /// Replace a config's node list in place (hierarchy re-probe found a
    /// better path). Derived contexts other than the caller's learn about
    /// it through `list_changed` as usual.
    pub fn replace_node_list(
        &self,
        kind: SearchKind,
        entries: Vec<NodeListEntry>,
        recheck_hierarchy: bool,
    ) {
        let mut inner = self.inner.lock();
        let Some(config) = inner.configs.get_mut(&kind) else {
            return;
        };
        config.node_list = entries;
        config.recheck_hierarchy = recheck_hierarchy;
        let new_check =
            (kind == SearchKind::Authentication).then(|| path_check(&config.node_list));
        if let Some(check) = new_check {
            inner.auth_path_check = Some(check);
        }
        Self::notify_contexts(&mut *inner, kind);
    }

    /// Update the persisted custom path list; returns the active policy so
    /// the caller can decide whether a re-switch is needed.
    pub fn set_custom_paths(
        &self,
        kind: SearchKind,
        paths: Vec<String>,
    ) -> Result<SearchPolicy, Status> {
        let mut inner = self.inner.lock();
        let config = inner.configs.get_mut(&kind).ok_or(Status::InvalidReference)?;
        config.source.set_custom_paths(paths);
        if let Err(err) = config.source.save() {
            warn!(error = %err, "could not persist custom path list");
        }
        Ok(config.policy)
    }

    pub fn network_defaults(&self, kind: SearchKind) -> Result<NetworkDefaults, Status> {
        self.with_config(kind, |c| c.source.config().network_defaults.clone())
            .ok_or(Status::InvalidReference)
    }

    /// Update the persisted network-defaults blob; returns the active
    /// policy for the follow-up re-switch.
    pub fn set_network_defaults(
        &self,
        kind: SearchKind,
        defaults: NetworkDefaults,
    ) -> Result<SearchPolicy, Status> {
        let mut inner = self.inner.lock();
        let config = inner.configs.get_mut(&kind).ok_or(Status::InvalidReference)?;
        config.source.set_network_defaults(defaults);
        if let Err(err) = config.source.save() {
            warn!(error = %err, "could not persist network defaults");
        }
        Ok(config.policy)
    }

    /// Query entry point: enforces the store-before-context lock order and
    /// the policy-switch rebase rules, then hands back the context guard
    /// that serializes the whole query call.
    ///
    /// With `list_changed` set: a call presenting a continuation token
    /// fails with `InvalidContinuation` (the token belongs to the old
    /// list); a fresh call atomically re-copies the node list from the
    /// store, drops tokens parked on the reference, and clears the flag.
    pub fn begin_query<'c>(
        &self,
        ref_id: RefId,
        ctx: &'c NodeReferenceContext,
        has_continuation: bool,
        continuations: &ContinuationRegistry,
    ) -> Result<MutexGuard<'c, ContextState>, Status> {
        let inner = self.inner.lock();
        let config = inner.configs.get(&ctx.kind).ok_or(Status::InvalidReference)?;

        // The Network search node has no switchable policy.
        if ctx.list_changed() && ctx.kind != SearchKind::Network {
            if has_continuation {
                return Err(Status::InvalidContinuation);
            }
            let mut state = ctx.lock_state();
            debug!(kind = %ctx.kind, "search policy switched, rebasing reference onto new node list");
            state.node_list = fresh_copies(&config.node_list);
            state.is_automatic = config.policy == SearchPolicy::Automatic;
            state.recheck_hierarchy = config.recheck_hierarchy;
            continuations.release_for_owner(ref_id);
            ctx.take_list_changed();
            return Ok(state);
        }

        Ok(ctx.lock_state())
    }

    fn notify_contexts(inner: &mut StoreInner, kind: SearchKind) {
        inner.contexts.retain(|w| w.strong_count() > 0);
        for weak in &inner.contexts {
            if let Some(ctx) = weak.upgrade() {
                if ctx.kind == kind {
                    ctx.mark_list_changed();
                }
            }
        }
    }
}

/// Concatenated node names, the switch-detection checksum.
fn path_check(entries: &[NodeListEntry]) -> String {
    entries
        .iter()
        .map(|e| e.name.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keep open-failure bookkeeping for node paths that survive a switch.
fn carry_reachability(old: &[NodeListEntry], new: &mut [NodeListEntry]) {
    for entry in new.iter_mut() {
        if let Some(prev) = old.iter().find(|o| o.path == entry.path) {
            entry.open_failed = prev.open_failed;
        }
    }
}
