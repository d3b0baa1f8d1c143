//! End-to-end traversal scenarios driven through the public service API.

use std::path::Path;
use std::sync::Arc;

use dirsearch::backend::memory::MemoryDirectory;
use dirsearch::engine::alias::AliasPayload;
use dirsearch::engine::{
    AllowAll, AttributeSearchRequest, RecordListRequest, SearchService, ServicePaths,
};
use dirsearch::error::Status;
use dirsearch::model::types::{
    ATTR_ALIAS_DATA, ATTR_META_SOURCE_PATH, ATTR_META_TARGET_PATH, Attribute, NodePath,
    PatternMatch, RECTYPE_GROUPS, RECTYPE_USER_ALIASES, RECTYPE_USERS, Record, SearchKind,
    SearchPolicy,
};
use dirsearch::policy::config_file::ConfigSource;
use dirsearch::wire::encode_record;

fn user(name: &str) -> Record {
    Record::new(RECTYPE_USERS, name)
        .with_attribute(Attribute::new("shell").with_value("/bin/sh"))
}

fn service_over(dir: &Arc<MemoryDirectory>) -> (SearchService, tempfile::TempDir) {
    let tmp = tempfile::TempDir::new().unwrap();
    let service = SearchService::new(
        dir.clone(),
        Arc::new(AllowAll),
        ServicePaths::under(tmp.path()),
    );
    service.initialize().unwrap();
    (service, tmp)
}

/// Pre-seed the Authentication config file before the service starts.
fn preconfigure(root: &Path, policy: SearchPolicy, custom_paths: &[&str]) {
    let mut source = ConfigSource::load(&root.join("config"), "authentication");
    source.set_policy(policy);
    source.set_custom_paths(custom_paths.iter().map(|s| s.to_string()).collect());
    source.save().unwrap();
}

/// Capacity that fits exactly `n` copies of `record` and no more.
fn capacity_for(record: &Record, n: usize) -> usize {
    let len = encode_record(record, false).len();
    // header (tag + count + end tag) + per-block offset slot + length-prefixed block
    12 + n * (4 + 4 + len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Decoded {
    rec_type: String,
    name: String,
    attrs: Vec<(String, Vec<String>)>,
}

fn decode(service: &SearchService, buffer: &[u8], count: u32) -> Vec<Decoded> {
    (1..=count)
        .map(|i| {
            let rec = service.get_record_entry(buffer, i).unwrap();
            let attrs = (1..=u32::from(rec.attr_count))
                .map(|a| {
                    let attr = service
                        .get_attribute_entry(rec.attr_list_ref, buffer, a)
                        .unwrap();
                    let values = (1..=u32::from(attr.value_count))
                        .map(|v| {
                            let raw = service
                                .get_attribute_value(attr.value_list_ref, buffer, v)
                                .unwrap();
                            String::from_utf8_lossy(&raw).into_owned()
                        })
                        .collect();
                    service.close_attribute_value_list(attr.value_list_ref).unwrap();
                    (attr.attr_type, values)
                })
                .collect();
            service.close_attribute_list(rec.attr_list_ref).unwrap();
            Decoded {
                rec_type: rec.rec_type,
                name: rec.name,
                attrs,
            }
        })
        .collect()
}

/// Drain a record-list query across however many continuations it takes.
fn collect_all(
    service: &SearchService,
    node: dirsearch::engine::context::RefId,
    mut req: RecordListRequest,
) -> Vec<Decoded> {
    let mut all = Vec::new();
    loop {
        let reply = service.get_record_list(node, &req).unwrap();
        all.extend(decode(service, &reply.buffer, reply.record_count));
        match reply.continuation {
            Some(token) => req.continuation = Some(token),
            None => return all,
        }
    }
}

// Scenario A: LocalOnly, one local node, three records, unlimited, roomy
// buffer: everything in one call, no token.
#[test]
fn local_only_returns_everything_in_one_call() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    let local = dir.local_node();
    for name in ["amy", "bo", "cho"] {
        local.add_record(user(name));
    }

    let tmp = tempfile::TempDir::new().unwrap();
    preconfigure(tmp.path(), SearchPolicy::LocalOnly, &[]);
    let service = SearchService::new(
        dir.clone(),
        Arc::new(AllowAll),
        ServicePaths::under(tmp.path()),
    );
    service.initialize().unwrap();

    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();
    let reply = service
        .get_record_list(node, &RecordListRequest::all_of_types([RECTYPE_USERS]))
        .unwrap();

    assert_eq!(reply.record_count, 3);
    assert!(reply.continuation.is_none());
    let names: Vec<_> = decode(&service, &reply.buffer, 3)
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, ["amy", "bo", "cho"]);
    service.close_virtual_node(node).unwrap();
}

// Scenario B: destination holds one record; first call returns one plus a
// token, resuming with a larger buffer returns the remaining two and no
// token.
#[test]
fn tiny_buffer_paginates_via_continuation() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    let local = dir.local_node();
    for name in ["amy", "bob", "cho"] {
        local.add_record(user(name));
    }

    let tmp = tempfile::TempDir::new().unwrap();
    preconfigure(tmp.path(), SearchPolicy::LocalOnly, &[]);
    let service = SearchService::new(
        dir.clone(),
        Arc::new(AllowAll),
        ServicePaths::under(tmp.path()),
    );
    service.initialize().unwrap();
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let mut req = RecordListRequest::all_of_types([RECTYPE_USERS]);
    req.buffer_capacity = capacity_for(&user("amy"), 1);
    let first = service.get_record_list(node, &req).unwrap();
    assert_eq!(first.record_count, 1);
    let token = first.continuation.expect("more data pending");

    req.buffer_capacity = 16 * 1024;
    req.continuation = Some(token);
    let second = service.get_record_list(node, &req).unwrap();
    assert_eq!(second.record_count, 2);
    assert!(second.continuation.is_none());

    let names: Vec<_> = decode(&service, &second.buffer, 2)
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, ["bob", "cho"]);
}

// A buffer too small for even one record fails with BufferTooSmall but
// carries a token that resumes cleanly.
#[test]
fn hopeless_buffer_reports_too_small_with_resumable_token() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    dir.local_node().add_record(user("amy"));

    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let mut req = RecordListRequest::all_of_types([RECTYPE_USERS]);
    req.buffer_capacity = 24;
    let err = service.get_record_list(node, &req).unwrap_err();
    let Status::BufferTooSmall {
        continuation: Some(token),
    } = err
    else {
        panic!("expected BufferTooSmall with token, got {err:?}");
    };

    req.buffer_capacity = 16 * 1024;
    req.continuation = Some(token);
    let reply = service.get_record_list(node, &req).unwrap();
    assert_eq!(reply.record_count, 1);
}

// Scenario C: Custom policy listing an unreachable node; local results
// still come back and no fatal error surfaces.
#[test]
fn unreachable_custom_node_is_skipped() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    dir.local_node().add_record(user("amy"));
    let ghost = NodePath::parse("/ldap/ghost");
    dir.ensure_node(&ghost);
    dir.set_unreachable(&ghost, true);

    let tmp = tempfile::TempDir::new().unwrap();
    preconfigure(tmp.path(), SearchPolicy::Custom, &["/ldap/ghost"]);
    let service = SearchService::new(
        dir.clone(),
        Arc::new(AllowAll),
        ServicePaths::under(tmp.path()),
    );
    service.initialize().unwrap();
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let all = collect_all(
        &service,
        node,
        RecordListRequest::all_of_types([RECTYPE_USERS]),
    );
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "amy");
}

// Scenario D: a user alias on one node transparently resolves to the real
// record on another node, with source/target path attributes attached.
#[test]
fn alias_expands_across_nodes_with_meta_paths() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);

    let node_x = NodePath::parse("/ldap/x");
    let node_y = NodePath::parse("/ldap/y");
    dir.ensure_node(&node_x).add_record(
        Record::new(RECTYPE_USER_ALIASES, "carol-alias").with_attribute(
            Attribute::new(ATTR_ALIAS_DATA).with_value(
                AliasPayload::new(vec!["carol".into()], RECTYPE_USERS, node_y.clone()).to_json(),
            ),
        ),
    );
    dir.ensure_node(&node_y).add_record(
        Record::new(RECTYPE_USERS, "carol")
            .with_attribute(Attribute::new("shell").with_value("/bin/bash")),
    );

    let tmp = tempfile::TempDir::new().unwrap();
    preconfigure(tmp.path(), SearchPolicy::Custom, &["/ldap/x"]);
    let service = SearchService::new(
        dir.clone(),
        Arc::new(AllowAll),
        ServicePaths::under(tmp.path()),
    );
    service.initialize().unwrap();
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let all = collect_all(
        &service,
        node,
        RecordListRequest::all_of_types([RECTYPE_USERS]),
    );
    assert_eq!(all.len(), 1);
    let carol = &all[0];
    assert_eq!(carol.rec_type, RECTYPE_USERS);
    assert_eq!(carol.name, "carol");
    let attr = |name: &str| {
        carol
            .attrs
            .iter()
            .find(|(t, _)| t == name)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(attr("shell"), Some(vec!["/bin/bash".into()]));
    assert_eq!(attr(ATTR_META_TARGET_PATH), Some(vec!["/ldap/y".into()]));
    assert_eq!(attr(ATTR_META_SOURCE_PATH), Some(vec!["/ldap/x".into()]));
}

// A user alias whose payload claims a non-user target type is skipped
// without failing the query.
#[test]
fn mismatched_alias_type_is_skipped() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    let target = NodePath::parse("/ldap/y");
    dir.local_node().add_record(
        Record::new(RECTYPE_USER_ALIASES, "bogus").with_attribute(
            Attribute::new(ATTR_ALIAS_DATA).with_value(
                AliasPayload::new(vec!["staff".into()], RECTYPE_GROUPS, target.clone()).to_json(),
            ),
        ),
    );
    dir.ensure_node(&target)
        .add_record(Record::new(RECTYPE_GROUPS, "staff"));
    dir.local_node().add_record(user("amy"));

    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();
    let all = collect_all(
        &service,
        node,
        RecordListRequest::all_of_types([RECTYPE_USERS]),
    );
    // Only the direct match; the mismatched alias contributed nothing.
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "amy");
}

// Scenario E: a policy switch invalidates tokens minted against the old
// node list.
#[test]
fn policy_switch_invalidates_held_token() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    let local = dir.local_node();
    for name in ["amy", "bob", "cho"] {
        local.add_record(user(name));
    }

    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 0)
        .unwrap();

    let mut req = RecordListRequest::all_of_types([RECTYPE_USERS]);
    req.buffer_capacity = capacity_for(&user("amy"), 1);
    let first = service.get_record_list(node, &req).unwrap();
    let token = first.continuation.expect("token for remaining records");

    // Root switches the policy while the token is outstanding.
    service.custom_call(node, 2, &[], &[]).unwrap();

    req.continuation = Some(token);
    assert_eq!(
        service.get_record_list(node, &req).unwrap_err(),
        Status::InvalidContinuation
    );

    // The parked state can still be released explicitly, exactly once.
    assert_eq!(service.release_continuation(token), Ok(()));
    assert_eq!(
        service.release_continuation(token),
        Err(Status::InvalidContinuation)
    );
}

// Record limit semantics: 0 means unlimited, a limit reached at the buffer
// boundary ends the query without a spurious token.
#[test]
fn record_limit_reached_exactly_emits_no_token() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    let local = dir.local_node();
    for name in ["ann", "ben", "cat", "dee"] {
        local.add_record(user(name));
    }

    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let mut req = RecordListRequest::all_of_types([RECTYPE_USERS]);
    req.records_limit = 2;
    req.buffer_capacity = capacity_for(&user("ann"), 2);
    let reply = service.get_record_list(node, &req).unwrap();
    assert_eq!(reply.record_count, 2);
    assert!(reply.continuation.is_none());
}

// The limit spans continuations: committed records are counted once,
// never dropped or double-counted across resumptions.
#[test]
fn record_limit_spans_continuations() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    let local = dir.local_node();
    for name in ["ann", "ben", "cat", "dee", "eve"] {
        local.add_record(user(name));
    }

    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let mut req = RecordListRequest::all_of_types([RECTYPE_USERS]);
    req.records_limit = 3;
    req.buffer_capacity = capacity_for(&user("ann"), 1);

    let mut total = Vec::new();
    loop {
        let reply = service.get_record_list(node, &req).unwrap();
        total.extend(decode(&service, &reply.buffer, reply.record_count));
        match reply.continuation {
            Some(token) => req.continuation = Some(token),
            None => break,
        }
    }
    let names: Vec<_> = total.into_iter().map(|d| d.name).collect();
    assert_eq!(names, ["ann", "ben", "cat"]);
}

// Backend-side paging: a node that hands out small pages still yields all
// records through repeated fetches within and across calls.
#[test]
fn backend_paging_is_transparent() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    let local = dir.local_node();
    for i in 0..7 {
        local.add_record(user(&format!("user{i}")));
    }
    local.set_page_size(Some(2));

    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();
    let all = collect_all(
        &service,
        node,
        RecordListRequest::all_of_types([RECTYPE_USERS]),
    );
    assert_eq!(all.len(), 7);
}

// A backend buffer-too-small error surfaces as BufferTooSmall with a
// token that re-issues the fetch on resumption.
#[test]
fn backend_buffer_too_small_suspends_and_resumes() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    let local = dir.local_node();
    local.add_record(user("amy"));
    local.fail_next_search_with_buffer_too_small();

    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let mut req = RecordListRequest::all_of_types([RECTYPE_USERS]);
    let err = service.get_record_list(node, &req).unwrap_err();
    let Status::BufferTooSmall {
        continuation: Some(token),
    } = err
    else {
        panic!("expected BufferTooSmall with token, got {err:?}");
    };

    req.continuation = Some(token);
    let reply = service.get_record_list(node, &req).unwrap();
    assert_eq!(reply.record_count, 1);
}

// Attribute value search drives the same traversal.
#[test]
fn attribute_search_merges_across_nodes() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    dir.local_node().add_record(
        Record::new(RECTYPE_USERS, "amy")
            .with_attribute(Attribute::new("shell").with_value("/bin/zsh")),
    );
    let extra = NodePath::parse("/ldap/one");
    dir.ensure_node(&extra).add_record(
        Record::new(RECTYPE_USERS, "zed")
            .with_attribute(Attribute::new("shell").with_value("/bin/zsh")),
    );
    dir.local_node().add_record(user("bo")); // /bin/sh, no match

    let tmp = tempfile::TempDir::new().unwrap();
    preconfigure(tmp.path(), SearchPolicy::Custom, &["/ldap/one"]);
    let service = SearchService::new(
        dir.clone(),
        Arc::new(AllowAll),
        ServicePaths::under(tmp.path()),
    );
    service.initialize().unwrap();
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let mut names = Vec::new();
    let mut req = AttributeSearchRequest {
        attr_type: "shell".into(),
        value_pattern: "zsh".into(),
        match_mode: PatternMatch::Contains,
        record_types: vec![RECTYPE_USERS.into()],
        requested_attrs: vec!["shell".into()],
        attrs_only: false,
        records_limit: 0,
        buffer_capacity: 16 * 1024,
        continuation: None,
    };
    loop {
        let reply = service.attribute_value_search(node, &req).unwrap();
        names.extend(
            decode(&service, &reply.buffer, reply.record_count)
                .into_iter()
                .map(|d| d.name),
        );
        match reply.continuation {
            Some(token) => req.continuation = Some(token),
            None => break,
        }
    }
    assert_eq!(names, ["amy", "zed"]);
}

// Attribute-only queries pack types with zero value counts.
#[test]
fn attrs_only_omits_values() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    dir.local_node().add_record(user("amy"));

    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let mut req = RecordListRequest::all_of_types([RECTYPE_USERS]);
    req.attrs_only = true;
    let reply = service.get_record_list(node, &req).unwrap();
    let all = decode(&service, &reply.buffer, reply.record_count);
    assert_eq!(all.len(), 1);
    let (attr_type, values) = &all[0].attrs[0];
    assert_eq!(attr_type, "shell");
    assert!(values.is_empty());
}

// Closed references reject every operation.
#[test]
fn closed_reference_is_invalid() {
    let dir = Arc::new(MemoryDirectory::new());
    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();
    service.close_virtual_node(node).unwrap();

    assert_eq!(
        service
            .get_record_list(node, &RecordListRequest::all_of_types([RECTYPE_USERS]))
            .unwrap_err(),
        Status::InvalidReference
    );
    assert_eq!(
        service.close_virtual_node(node).unwrap_err(),
        Status::InvalidReference
    );
}

// Unknown virtual node names do not open.
#[test]
fn unknown_node_name_fails_open() {
    let dir = Arc::new(MemoryDirectory::new());
    let (service, _tmp) = service_over(&dir);
    assert_eq!(
        service.open_virtual_node("/search/bogus", 501).unwrap_err(),
        Status::InvalidReference
    );
}
