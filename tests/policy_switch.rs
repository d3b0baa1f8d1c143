//! Policy switching, custom calls, persistence, and node-info reporting.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dirsearch::backend::memory::MemoryDirectory;
use dirsearch::engine::{AllowAll, DenyAll, RecordListRequest, SearchService, ServicePaths};
use dirsearch::error::Status;
use dirsearch::model::types::{
    ATTR_SEARCH_PATH, ATTR_SEARCH_POLICY, Attribute, NodePath, RECTYPE_USERS, Record, SearchKind,
    SearchPolicy,
};
use dirsearch::policy::config_file::{ConfigSource, NetworkDefaults, PolicyMarker};

const SET_POLICY_AUTOMATIC: u32 = 1;
const SET_POLICY_LOCAL_ONLY: u32 = 2;
const SET_POLICY_CUSTOM: u32 = 3;
const SET_CUSTOM_NODE_LIST: u32 = 4;
const READ_NETWORK_DEFAULTS_SIZE: u32 = 5;
const READ_NETWORK_DEFAULTS: u32 = 6;
const WRITE_NETWORK_DEFAULTS: u32 = 7;
const LIST_UNREACHABLE_NODES: u32 = 8;

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

fn preconfigure(root: &Path, policy: SearchPolicy, custom_paths: &[&str]) {
    let mut source = ConfigSource::load(&root.join("config"), "authentication");
    source.set_policy(policy);
    source.set_custom_paths(custom_paths.iter().map(|s| s.to_string()).collect());
    source.save().unwrap();
}

fn names_from(service: &SearchService, node: dirsearch::engine::context::RefId) -> Vec<String> {
    let mut req = RecordListRequest::all_of_types([RECTYPE_USERS]);
    let mut names = Vec::new();
    loop {
        let reply = service.get_record_list(node, &req).unwrap();
        for i in 1..=reply.record_count {
            names.push(service.get_record_entry(&reply.buffer, i).unwrap().name);
        }
        match reply.continuation {
            Some(token) => req.continuation = Some(token),
            None => return names,
        }
    }
}

#[test]
fn custom_call_switch_rebases_open_references() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    dir.local_node().add_record(user("amy"));
    let extra = NodePath::parse("/ldap/one");
    dir.ensure_node(&extra).add_record(user("zed"));

    let (service, tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 0)
        .unwrap();

    assert_eq!(names_from(&service, node), ["amy"]);

    // Install a custom list and activate the custom policy (root, blank
    // token).
    let blob = serde_json::to_vec(&["/ldap/one"]).unwrap();
    service
        .custom_call(node, SET_CUSTOM_NODE_LIST, &[], &blob)
        .unwrap();
    service
        .custom_call(node, SET_POLICY_CUSTOM, &[], &[])
        .unwrap();

    // The already-open reference rebases on its next fresh call.
    assert_eq!(names_from(&service, node), ["amy", "zed"]);

    // Persisted for the next service start.
    let reloaded = ConfigSource::load(&tmp.path().join("config"), "authentication");
    assert_eq!(reloaded.policy(), SearchPolicy::Custom);
    assert_eq!(reloaded.config().custom_paths, ["/ldap/one"]);
}

#[test]
fn marker_file_follows_switches() {
    let dir = Arc::new(MemoryDirectory::new());
    let (service, tmp) = service_over(&dir);
    let marker = PolicyMarker::new(tmp.path().join("run"));
    assert_eq!(marker.active(), Some(SearchPolicy::Automatic));

    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 0)
        .unwrap();
    service
        .custom_call(node, SET_POLICY_LOCAL_ONLY, &[], &[])
        .unwrap();
    assert_eq!(marker.active(), Some(SearchPolicy::LocalOnly));

    service
        .custom_call(node, SET_POLICY_AUTOMATIC, &[], &[])
        .unwrap();
    assert_eq!(marker.active(), Some(SearchPolicy::Automatic));
}

#[test]
fn unauthorized_custom_call_is_denied() {
    let dir = Arc::new(MemoryDirectory::new());
    let tmp = tempfile::TempDir::new().unwrap();
    let service = SearchService::new(
        dir.clone(),
        Arc::new(DenyAll),
        ServicePaths::under(tmp.path()),
    );
    service.initialize().unwrap();

    // Ordinary user with a token the authorizer rejects.
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();
    assert_eq!(
        service
            .custom_call(node, SET_POLICY_LOCAL_ONLY, b"token", &[])
            .unwrap_err(),
        Status::PermissionDenied
    );

    // Root with a blank token bypasses the authorizer.
    let root_ref = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 0)
        .unwrap();
    service
        .custom_call(root_ref, SET_POLICY_LOCAL_ONLY, &[], &[])
        .unwrap();

    // The unauthenticated reachability listing works for anyone.
    service
        .custom_call(node, LIST_UNREACHABLE_NODES, b"", &[])
        .unwrap();
}

#[test]
fn network_defaults_blob_round_trips() {
    let dir = Arc::new(MemoryDirectory::new());
    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 0)
        .unwrap();

    let blob = service
        .custom_call(node, READ_NETWORK_DEFAULTS, &[], &[])
        .unwrap();
    let defaults: NetworkDefaults = serde_json::from_slice(&blob).unwrap();
    assert!(defaults.enabled);

    let size_bytes = service
        .custom_call(node, READ_NETWORK_DEFAULTS_SIZE, &[], &[])
        .unwrap();
    let size = u32::from_ne_bytes(size_bytes[..4].try_into().unwrap());
    assert_eq!(size as usize, blob.len());

    let updated = NetworkDefaults {
        enabled: false,
        servers: vec!["ldap://directory.example".into()],
    };
    service
        .custom_call(
            node,
            WRITE_NETWORK_DEFAULTS,
            &[],
            &serde_json::to_vec(&updated).unwrap(),
        )
        .unwrap();

    let blob = service
        .custom_call(node, READ_NETWORK_DEFAULTS, &[], &[])
        .unwrap();
    let read_back: NetworkDefaults = serde_json::from_slice(&blob).unwrap();
    assert_eq!(read_back, updated);
}

#[test]
fn custom_calls_rejected_on_network_node() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_network_defaults(vec![NodePath::parse("/ldap/dhcp-1")]);
    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Network.node_name(), 0)
        .unwrap();
    assert_eq!(
        service
            .custom_call(node, SET_POLICY_LOCAL_ONLY, &[], &[])
            .unwrap_err(),
        Status::InvalidReference
    );
}

#[test]
fn network_node_aggregates_registered_network_directories() {
    let dir = Arc::new(MemoryDirectory::new());
    let ldap = NodePath::parse("/ldap/dhcp-1");
    dir.set_network_defaults(vec![ldap.clone()]);
    dir.node(&ldap).unwrap().add_record(user("remote"));

    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Network.node_name(), 501)
        .unwrap();
    assert_eq!(names_from(&service, node), ["remote"]);
}

#[test]
fn network_node_without_directories_has_no_path() {
    let dir = Arc::new(MemoryDirectory::new());
    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Network.node_name(), 501)
        .unwrap();
    assert_eq!(
        service
            .get_record_list(node, &RecordListRequest::all_of_types([RECTYPE_USERS]))
            .unwrap_err(),
        Status::PathNotDefined
    );
}

#[test]
fn unknown_opcode_is_invalid_request() {
    let dir = Arc::new(MemoryDirectory::new());
    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 0)
        .unwrap();
    assert_eq!(
        service.custom_call(node, 99, &[], &[]).unwrap_err(),
        Status::InvalidRequest
    );
}

#[test]
fn node_info_reports_path_policy_and_read_only() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_hierarchy(Some(vec![NodePath::parse("/domain/root")]));
    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let info = service.get_node_info(node, &[], 8192).unwrap();
    assert_eq!(info.attr_count, 3);

    let mut attrs = std::collections::HashMap::new();
    for i in 1..=u32::from(info.attr_count) {
        let attr = service
            .get_attribute_entry(info.attr_list_ref, &info.buffer, i)
            .unwrap();
        let values: Vec<String> = (1..=u32::from(attr.value_count))
            .map(|v| {
                String::from_utf8_lossy(
                    &service
                        .get_attribute_value(attr.value_list_ref, &info.buffer, v)
                        .unwrap(),
                )
                .into_owned()
            })
            .collect();
        attrs.insert(attr.attr_type.clone(), values);
    }

    assert_eq!(
        attrs[ATTR_SEARCH_PATH],
        ["/local/default", "/local/files", "/domain/root"]
    );
    assert_eq!(attrs[ATTR_SEARCH_POLICY], ["automatic"]);
    assert_eq!(attrs["read-only"], ["true"]);
}

#[test]
fn node_info_honors_requested_filter() {
    let dir = Arc::new(MemoryDirectory::new());
    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();
    let info = service
        .get_node_info(node, &[ATTR_SEARCH_POLICY.to_string()], 8192)
        .unwrap();
    assert_eq!(info.attr_count, 1);
}

#[test]
fn late_hierarchy_is_picked_up_on_node_advance() {
    let dir = Arc::new(MemoryDirectory::new());
    dir.set_local_paths(vec![NodePath::parse("/local/default")]);
    dir.local_node().add_record(user("amy"));

    // Hierarchy not discoverable at first resolution.
    let (service, _tmp) = service_over(&dir);
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();
    assert_eq!(names_from(&service, node), ["amy"]);

    // The domain comes up afterwards, with its own records.
    let root = NodePath::parse("/domain/root");
    dir.set_hierarchy(Some(vec![root.clone()]));
    dir.node(&root).unwrap().add_record(user("dana"));

    // The same open reference discovers it while advancing past the local
    // node — no re-open, no policy switch.
    assert_eq!(names_from(&service, node), ["amy", "dana"]);

    // The shared config was rebuilt too: new opens see the domain.
    let fresh = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();
    let info = service
        .get_node_info(fresh, &[ATTR_SEARCH_PATH.to_string()], 8192)
        .unwrap();
    let attr = service
        .get_attribute_entry(info.attr_list_ref, &info.buffer, 1)
        .unwrap();
    let paths: Vec<String> = (1..=u32::from(attr.value_count))
        .map(|v| {
            String::from_utf8_lossy(
                &service
                    .get_attribute_value(attr.value_list_ref, &info.buffer, v)
                    .unwrap(),
            )
            .into_owned()
        })
        .collect();
    assert!(paths.contains(&"/domain/root".to_string()));
}

#[test]
fn corrupted_config_is_quarantined_at_startup() {
    let dir = Arc::new(MemoryDirectory::new());
    let tmp = tempfile::TempDir::new().unwrap();
    let config_dir = tmp.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("authentication-search-node.json"), b"][").unwrap();

    let service = SearchService::new(
        dir.clone(),
        Arc::new(AllowAll),
        ServicePaths::under(tmp.path()),
    );
    service.initialize().unwrap();
    assert_eq!(
        service.policy_of(SearchKind::Authentication),
        Some(SearchPolicy::Automatic)
    );
    assert!(
        config_dir
            .join("authentication-search-node.json.corrupt")
            .exists()
    );
}

#[test]
fn unreachable_nodes_are_listed() {
    let dir = Arc::new(MemoryDirectory::new());
    let up = NodePath::parse("/ldap/up");
    let down = NodePath::parse("/ldap/down");
    dir.ensure_node(&up);
    dir.ensure_node(&down);
    dir.set_unreachable(&down, true);

    let tmp = tempfile::TempDir::new().unwrap();
    preconfigure(tmp.path(), SearchPolicy::Custom, &["/ldap/up", "/ldap/down"]);
    let service = SearchService::new(
        dir.clone(),
        Arc::new(AllowAll),
        ServicePaths::under(tmp.path()),
    );
    service.initialize().unwrap();
    let node = service
        .open_virtual_node(SearchKind::Authentication.node_name(), 501)
        .unwrap();

    let blob = service
        .custom_call(node, LIST_UNREACHABLE_NODES, &[], &[])
        .unwrap();
    let listed: Vec<String> = serde_json::from_slice(&blob).unwrap();
    assert!(listed.contains(&"/ldap/down".to_string()));
    assert!(!listed.contains(&"/ldap/up".to_string()));
}

#[test]
fn operations_fail_until_initialized() {
    let dir = Arc::new(MemoryDirectory::new());
    let tmp = tempfile::TempDir::new().unwrap();
    let service = Arc::new(SearchService::new(
        dir.clone(),
        Arc::new(AllowAll),
        ServicePaths::under(tmp.path()),
    ));

    assert_eq!(
        service
            .open_virtual_node(SearchKind::Authentication.node_name(), 0)
            .unwrap_err(),
        Status::NotInitialized
    );
    assert_eq!(
        service.wait_until_ready(Duration::from_millis(10)).unwrap_err(),
        Status::NotInitialized
    );

    // Readiness propagates to a waiter on another thread.
    let waiter = {
        let service = service.clone();
        std::thread::spawn(move || service.wait_until_ready(Duration::from_secs(5)))
    };
    std::thread::sleep(Duration::from_millis(50));
    service.initialize().unwrap();
    waiter.join().unwrap().unwrap();

    service
        .open_virtual_node(SearchKind::Authentication.node_name(), 0)
        .unwrap();
}
