//! The continuation-driven traversal state machine.
//!
//! One query call walks the reference's node list in order, fanning the
//! record query out to each backend node, translating results into the
//! wire format, and merging them into the caller's output buffer. When the
//! buffer fills or the caller's record limit is reached before the list is
//! exhausted, the machine parks its state in the continuation registry and
//! hands back a token; the next call resumes exactly where it stopped.
//!
//! Per-node failures are absorbed: a node that cannot be opened or errors
//! mid-search is skipped and traversal advances. Only buffer-too-small
//! (recoverable via token) and continuation misuse surface to the caller.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{BackendError, BackendNode, Directory, NodeQuery, QueryKind};
use crate::engine::alias::{self, MAX_EXPANSION_DEPTH};
use crate::engine::context::{ContextState, NodeReferenceContext, RefId};
use crate::engine::continuation::{
    ContinuationHandle, ContinuationRegistry, ContinuationState, ResumePoint,
};
use crate::engine::store::SearchConfigStore;
use crate::error::Status;
use crate::model::types::{
    ATTR_ALIAS_DATA, ATTR_META_SOURCE_PATH, ATTR_META_TARGET_PATH, Attribute, NodePath,
    PatternMatch, Record, SearchPolicy,
};
use crate::policy::resolver::{NodeListEntry, NodeOrigin, SearchPathResolver, fresh_copies};
use crate::wire::writer::{ResultBuffer, encode_record};

/// One record/attribute query against a virtual search node.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: NodeQuery,
    pub buffer_capacity: usize,
    /// 0 = unlimited.
    pub records_limit: u32,
    pub continuation: Option<ContinuationHandle>,
}

/// Result of one query call.
#[derive(Debug)]
pub struct QueryReply {
    /// Packed result buffer (see [`crate::wire`]).
    pub buffer: Vec<u8>,
    /// Records committed into `buffer` by this call.
    pub record_count: u32,
    /// Present only if more data may exist.
    pub continuation: Option<ContinuationHandle>,
}

/// Shared collaborators the state machine runs against.
pub struct QueryRuntime<'a> {
    pub directory: &'a Arc<dyn Directory>,
    pub store: &'a SearchConfigStore,
    pub continuations: &'a ContinuationRegistry,
    pub resolver: &'a SearchPathResolver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Fetch,
    Drain,
    FetchAliases,
    ExpandAliases,
    Advance,
    Done,
}

fn resume_to_run(resume: ResumePoint) -> RunState {
    match resume {
        ResumePoint::Fetch => RunState::Fetch,
        ResumePoint::Drain => RunState::Drain,
        ResumePoint::FetchAliases => RunState::FetchAliases,
        ResumePoint::ExpandAliases => RunState::ExpandAliases,
        ResumePoint::Advance => RunState::Advance,
    }
}

enum Exit {
    Done,
    Park { resume: ResumePoint, too_small: bool },
}

impl QueryRuntime<'_> {
    /// Run the state machine for one call. The caller holds the context
    /// guard for the whole run, serializing calls on the same reference.
    pub fn run(
        &self,
        ref_id: RefId,
        ctx: &NodeReferenceContext,
        state: &mut ContextState,
        req: &QueryRequest,
    ) -> Result<QueryReply, Status> {
        if state.node_list.is_empty() {
            return Err(Status::PathNotDefined);
        }

        let mut cont = match req.continuation {
            Some(handle) => {
                let mut cont = self.continuations.take(handle, ref_id)?;
                if cont.node_index >= state.node_list.len() {
                    return Err(Status::InvalidContinuation);
                }
                if cont.buffer_capacity != req.buffer_capacity {
                    // Resized destination buffer. Translated records with no
                    // backend cursor can simply be re-drained; with a cursor
                    // still open the retained window is discarded and the
                    // backend fetch re-issued, accepting that records between
                    // the window start and the cursor are re-read or lost.
                    if cont.resume == ResumePoint::Drain && cont.backend_cursor.is_some() {
                        cont.pending.clear();
                        cont.rec_index = 0;
                        cont.resume = ResumePoint::Fetch;
                    }
                    cont.buffer_capacity = req.buffer_capacity;
                }
                cont
            }
            None => {
                let check = alias::alias_check(&req.query);
                let Some(node_index) = self.find_open_node(state, 0) else {
                    warn!("no node in the search path could be opened");
                    let out = ResultBuffer::new(req.buffer_capacity);
                    return Ok(QueryReply {
                        buffer: out.into_bytes(),
                        record_count: 0,
                        continuation: None,
                    });
                };
                ContinuationState {
                    node_index,
                    resume: ResumePoint::Fetch,
                    pending: Vec::new(),
                    rec_index: 0,
                    backend_cursor: None,
                    alias_types: check.alias_types,
                    meta_target: check.meta_target,
                    meta_source: check.meta_source,
                    records_limit: req.records_limit,
                    records_emitted: 0,
                    expansion_depth: 0,
                    buffer_capacity: req.buffer_capacity,
                }
            }
        };

        let mut out = ResultBuffer::new(req.buffer_capacity);
        let mut run = resume_to_run(cont.resume);

        let exit = loop {
            match run {
                RunState::Fetch => {
                    if limit_reached(&cont, out.block_count()) {
                        run = RunState::Done;
                        continue;
                    }
                    let Some(handle) = open_entry(self.directory, &mut state.node_list[cont.node_index])
                    else {
                        run = RunState::Advance;
                        continue;
                    };
                    let want = fetch_limit(&cont, out.block_count());
                    match handle.search(&req.query, want, cont.backend_cursor.take()) {
                        Ok(page) => {
                            cont.pending = page.records;
                            cont.rec_index = 0;
                            cont.backend_cursor = page.cursor;
                            run = if !cont.pending.is_empty() {
                                RunState::Drain
                            } else if cont.backend_cursor.is_some() {
                                RunState::Fetch
                            } else {
                                after_direct_matches(&cont)
                            };
                        }
                        Err(BackendError::NotFound) => {
                            run = after_direct_matches(&cont);
                        }
                        Err(BackendError::BufferTooSmall) => {
                            break Exit::Park {
                                resume: ResumePoint::Fetch,
                                too_small: true,
                            };
                        }
                        Err(err) => {
                            warn!(
                                node = %state.node_list[cont.node_index].name,
                                error = %err,
                                "backend node failed, skipping"
                            );
                            run = RunState::Advance;
                        }
                    }
                }

                RunState::Drain => {
                    let mut full = false;
                    while cont.rec_index < cont.pending.len()
                        && !limit_reached(&cont, out.block_count())
                    {
                        let payload =
                            encode_record(&cont.pending[cont.rec_index], req.query.attrs_only);
                        match out.add_block(&payload) {
                            Ok(()) => cont.rec_index += 1,
                            Err(_) => {
                                full = true;
                                break;
                            }
                        }
                    }
                    if full {
                        // Nothing committed at all means the caller's buffer
                        // cannot hold even one record of this window.
                        let too_small = out.is_empty();
                        let resume = if too_small && cont.backend_cursor.is_some() {
                            ResumePoint::Fetch
                        } else {
                            ResumePoint::Drain
                        };
                        break Exit::Park { resume, too_small };
                    }
                    if limit_reached(&cont, out.block_count()) {
                        run = RunState::Done;
                    } else if cont.backend_cursor.is_some() {
                        run = RunState::Fetch;
                    } else {
                        run = after_direct_matches(&cont);
                    }
                }

                RunState::FetchAliases => {
                    if limit_reached(&cont, out.block_count()) {
                        run = RunState::Done;
                        continue;
                    }
                    let Some(handle) = open_entry(self.directory, &mut state.node_list[cont.node_index])
                    else {
                        run = RunState::Advance;
                        continue;
                    };
                    let aq = alias_fetch_query(&req.query, &cont.alias_types);
                    let want = fetch_limit(&cont, out.block_count());
                    match handle.search(&aq, want, cont.backend_cursor.take()) {
                        Ok(page) => {
                            cont.pending = page.records;
                            cont.rec_index = 0;
                            cont.backend_cursor = page.cursor;
                            run = if !cont.pending.is_empty() {
                                RunState::ExpandAliases
                            } else if cont.backend_cursor.is_some() {
                                RunState::FetchAliases
                            } else {
                                RunState::Advance
                            };
                        }
                        Err(err) => {
                            debug!(error = %err, "alias fetch failed, advancing");
                            run = RunState::Advance;
                        }
                    }
                }

                RunState::ExpandAliases => {
                    cont.expansion_depth += 1;
                    if cont.expansion_depth > MAX_EXPANSION_DEPTH {
                        // Alias cycle guard: silently truncate further
                        // expansion for this node instead of failing.
                        debug!(
                            node = %state.node_list[cont.node_index].name,
                            "alias expansion depth exceeded, truncating"
                        );
                        cont.pending.clear();
                        cont.rec_index = 0;
                        cont.backend_cursor = None;
                        cont.expansion_depth = 0;
                        run = RunState::Advance;
                        continue;
                    }
                    let source_path = state.node_list[cont.node_index].path.clone();
                    let mut full = false;
                    while cont.rec_index < cont.pending.len()
                        && !limit_reached(&cont, out.block_count())
                    {
                        let alias_rec = &cont.pending[cont.rec_index];
                        let blocks =
                            self.expand_one(alias_rec, &source_path, req, &cont, out.block_count());
                        // All-or-nothing per alias so a resumption never
                        // re-commits half of an expansion.
                        match out.try_add_blocks(&blocks) {
                            Ok(()) => cont.rec_index += 1,
                            Err(_) => {
                                full = true;
                                break;
                            }
                        }
                    }
                    if full {
                        break Exit::Park {
                            resume: ResumePoint::ExpandAliases,
                            too_small: out.is_empty(),
                        };
                    }
                    if limit_reached(&cont, out.block_count()) {
                        run = RunState::Done;
                    } else if cont.backend_cursor.is_some() {
                        run = RunState::FetchAliases;
                    } else if out.is_empty() {
                        run = RunState::Advance;
                    } else {
                        // Return what the expansion produced; the next call
                        // advances to the next node.
                        break Exit::Park {
                            resume: ResumePoint::Advance,
                            too_small: false,
                        };
                    }
                }

                RunState::Advance => {
                    if cont.node_index == 0 && state.is_automatic {
                        self.maybe_reprobe_hierarchy(ctx, state);
                    }
                    cont.expansion_depth = 0;
                    cont.backend_cursor = None;
                    cont.pending.clear();
                    cont.rec_index = 0;
                    match self.find_open_node(state, cont.node_index + 1) {
                        Some(next) => {
                            cont.node_index = next;
                            if out.is_empty() {
                                run = RunState::Fetch;
                            } else {
                                break Exit::Park {
                                    resume: ResumePoint::Fetch,
                                    too_small: false,
                                };
                            }
                        }
                        // End of the search path is not itself an error.
                        None => run = RunState::Done,
                    }
                }

                RunState::Done => break Exit::Done,
            }
        };

        let record_count = out.block_count();
        match exit {
            Exit::Done => Ok(QueryReply {
                buffer: out.into_bytes(),
                record_count,
                continuation: None,
            }),
            Exit::Park { resume, too_small } => {
                cont.records_emitted = cont.records_emitted.saturating_add(record_count);
                cont.resume = resume;
                let handle = self.continuations.park(ref_id, cont);
                debug!(token = handle.as_raw(), records = record_count, "parked continuation");
                if too_small {
                    Err(Status::BufferTooSmall {
                        continuation: Some(handle),
                    })
                } else {
                    Ok(QueryReply {
                        buffer: out.into_bytes(),
                        record_count,
                        continuation: Some(handle),
                    })
                }
            }
        }
    }

    /// Expand one alias record into encoded target-record blocks. Every
    /// failure shape (bad payload, type mismatch, unreachable target node,
    /// failed target query) skips the alias by returning no blocks.
    fn expand_one(
        &self,
        alias_rec: &Record,
        source_path: &NodePath,
        req: &QueryRequest,
        cont: &ContinuationState,
        out_count: u32,
    ) -> Vec<Vec<u8>> {
        let Some(payload) = alias::parse_payload(alias_rec) else {
            return Vec::new();
        };
        if !alias::payload_matches(&alias_rec.rec_type, &payload) {
            debug!(
                alias = %alias_rec.name,
                declared = %payload.rec_type,
                "alias type mismatch, skipping"
            );
            return Vec::new();
        }
        let target = match self.directory.open(&payload.location) {
            Ok(target) => target,
            Err(err) => {
                debug!(location = %payload.location, error = %err, "alias target unreachable, skipping");
                return Vec::new();
            }
        };

        let kind = match &req.query.kind {
            QueryKind::RecordList { .. } => QueryKind::RecordList {
                name_patterns: payload.names.clone(),
                match_mode: PatternMatch::Exact,
            },
            QueryKind::AttributeSearch {
                attr_type,
                value_pattern,
                match_mode,
            } => QueryKind::AttributeSearch {
                attr_type: attr_type.clone(),
                value_pattern: value_pattern.clone(),
                match_mode: *match_mode,
            },
        };
        let target_query = NodeQuery {
            kind,
            record_types: vec![payload.rec_type.clone()],
            requested_attrs: req.query.requested_attrs.clone(),
            attrs_only: req.query.attrs_only,
        };

        let want = fetch_limit(cont, out_count);
        let page = match target.search(&target_query, want, None) {
            Ok(page) => page,
            Err(err) => {
                debug!(location = %payload.location, error = %err, "alias target query failed, skipping");
                return Vec::new();
            }
        };

        page.records
            .iter()
            .map(|rec| {
                let mut rec = rec.clone();
                if cont.meta_target {
                    rec.attributes.push(
                        Attribute::new(ATTR_META_TARGET_PATH)
                            .with_value(payload.location.to_string()),
                    );
                }
                if cont.meta_source {
                    rec.attributes.push(
                        Attribute::new(ATTR_META_SOURCE_PATH).with_value(source_path.to_string()),
                    );
                }
                encode_record(&rec, req.query.attrs_only)
            })
            .collect()
    }

    /// Lazily re-probe for an enclosing hierarchical domain after the
    /// local node has been consulted. Handles the hierarchy coming up
    /// after initial resolution degraded to local-only: the shared config
    /// is rebuilt and this reference adopts the new list in place.
    fn maybe_reprobe_hierarchy(&self, ctx: &NodeReferenceContext, state: &mut ContextState) {
        if state
            .node_list
            .iter()
            .any(|e| e.origin == NodeOrigin::Hierarchy)
        {
            return;
        }
        let Ok(chain) = self.directory.hierarchy_paths() else {
            return;
        };
        if chain.is_empty() {
            return;
        }
        info!(kind = %ctx.kind, "hierarchical domain became reachable, rebuilding automatic search path");
        let Some(config) = self.store.with_config(ctx.kind, |c| c.source.config().clone()) else {
            return;
        };
        let resolved = self.resolver.resolve(SearchPolicy::Automatic, &config);
        self.store.replace_node_list(
            ctx.kind,
            fresh_copies(&resolved.entries),
            resolved.recheck_hierarchy,
        );
        state.node_list = resolved.entries;
        state.recheck_hierarchy = resolved.recheck_hierarchy;
        // replace_node_list flagged every context of this kind, including
        // ours; we already hold the fresh list.
        ctx.take_list_changed();
    }

    /// First node at or after `from` that opens; failures are marked and
    /// skipped. Handles are cached for subsequent calls on the reference.
    fn find_open_node(&self, state: &mut ContextState, from: usize) -> Option<usize> {
        (from..state.node_list.len())
            .find(|&i| open_entry(self.directory, &mut state.node_list[i]).is_some())
    }
}

/// Direct matches for a node are exhausted: aliases next if registered,
/// otherwise advance.
fn after_direct_matches(cont: &ContinuationState) -> RunState {
    if cont.alias_types.is_empty() {
        RunState::Advance
    } else {
        RunState::FetchAliases
    }
}

fn limit_reached(cont: &ContinuationState, out_count: u32) -> bool {
    cont.records_limit != 0 && cont.records_emitted + out_count >= cont.records_limit
}

/// Backend-side bound for the next fetch: remaining records, or 0 for
/// unlimited. Callers check `limit_reached` first.
fn fetch_limit(cont: &ContinuationState, out_count: u32) -> u32 {
    if cont.records_limit == 0 {
        0
    } else {
        cont.records_limit
            .saturating_sub(cont.records_emitted)
            .saturating_sub(out_count)
    }
}

/// Open a node-list entry lazily, caching the handle on success.
fn open_entry(
    directory: &Arc<dyn Directory>,
    entry: &mut NodeListEntry,
) -> Option<Arc<dyn BackendNode>> {
    if let Some(handle) = &entry.handle {
        return Some(handle.clone());
    }
    match directory.open(&entry.path) {
        Ok(handle) => {
            entry.handle = Some(handle.clone());
            entry.open_failed = false;
            Some(handle)
        }
        Err(err) => {
            if !entry.open_failed {
                warn!(node = %entry.name, error = %err, "could not open backend node");
            }
            entry.open_failed = true;
            None
        }
    }
}

/// The alias pass re-uses the caller's name filter for record-list queries
/// and fetches every alias record for value searches; only the designated
/// payload attribute is requested.
fn alias_fetch_query(original: &NodeQuery, alias_types: &[String]) -> NodeQuery {
    let kind = match &original.kind {
        QueryKind::RecordList {
            name_patterns,
            match_mode,
        } => QueryKind::RecordList {
            name_patterns: name_patterns.clone(),
            match_mode: *match_mode,
        },
        QueryKind::AttributeSearch { .. } => QueryKind::RecordList {
            name_patterns: Vec::new(),
            match_mode: PatternMatch::Any,
        },
    };
    NodeQuery {
        kind,
        record_types: alias_types.to_vec(),
        requested_attrs: vec![ATTR_ALIAS_DATA.to_string()],
        attrs_only: false,
    }
}
