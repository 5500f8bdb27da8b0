use super::*;
use mesh_cds_controller_core::{destination::Subset, ConfigKey, Kind, WatchedResource};
use std::collections::BTreeSet;

const FOO: &str = "foo.ns-0.svc.cluster.local";
const BAR: &str = "bar.ns-0.svc.cluster.local";

fn mk_delta(push: &Arc<PushContext>, keys: impl IntoIterator<Item = ConfigKey>) -> PushRequest {
    PushRequest {
        push: push.clone(),
        configs_updated: keys.into_iter().collect(),
    }
}

fn mk_rule(revision: &str, host: &str, subsets: &[&str]) -> Arc<Config> {
    mk_dest_rule(
        "foo",
        "ns-0",
        revision,
        DestinationPolicy {
            host: host.to_string(),
            subsets: subsets
                .iter()
                .map(|name| Subset {
                    name: name.to_string(),
                    labels: labels(name),
                    traffic_policy: None,
                })
                .collect(),
            ..Default::default()
        },
    )
}

fn mk_subsets_rule(revision: &str, subsets: &[&str]) -> Arc<Config> {
    mk_rule(revision, FOO, subsets)
}

fn build_delta(
    test: &TestConfig,
    proxy: &Proxy,
    req: &PushRequest,
    watched: &[&str],
) -> ClusterResponse {
    test.generator
        .build_delta_clusters(proxy, req, &WatchedResource::new(watched.iter().copied()))
        .expect("delta clusters must build")
}

fn assert_disjoint(rsp: &ClusterResponse) {
    let built = names(rsp).into_iter().collect::<BTreeSet<_>>();
    for name in &rsp.removed {
        assert!(!built.contains(name.as_str()), "{name} is both built and removed");
    }
}

#[test]
fn deleted_service_removes_its_cluster() {
    let test = TestConfig::default();
    let bar = Arc::new(mk_service("bar", "ns-0", [(80, Protocol::Http)]));
    let proxy = mk_sidecar(vec![bar], vec![]);
    let push = Arc::new(mk_push("2"));

    let req = mk_delta(&push, [ConfigKey::new(Kind::ServiceEntry, FOO, "ns-0")]);
    let rsp = build_delta(
        &test,
        &proxy,
        &req,
        &[
            "outbound|80||foo.ns-0.svc.cluster.local",
            "outbound|80||bar.ns-0.svc.cluster.local",
        ],
    );

    assert!(rsp.delta);
    assert_eq!(rsp.removed, vec!["outbound|80||foo.ns-0.svc.cluster.local"]);
    assert!(!names(&rsp).iter().any(|n| n.ends_with(FOO)));
    // Unaffected services are neither rebuilt nor removed.
    assert!(!names(&rsp).contains(&"outbound|80||bar.ns-0.svc.cluster.local"));
}

#[test]
fn deleted_service_removes_its_subsets() {
    let test = TestConfig::default();
    let proxy = mk_sidecar(vec![], vec![]);
    let push = Arc::new(mk_push("2"));

    let req = mk_delta(&push, [ConfigKey::new(Kind::ServiceEntry, FOO, "ns-0")]);
    let rsp = build_delta(
        &test,
        &proxy,
        &req,
        &[
            "outbound|80||foo.ns-0.svc.cluster.local",
            "outbound|80|v1|foo.ns-0.svc.cluster.local",
            "outbound|9090||foo.ns-0.svc.cluster.local",
        ],
    );
    assert_eq!(
        rsp.removed,
        vec![
            "outbound|80|v1|foo.ns-0.svc.cluster.local",
            "outbound|80||foo.ns-0.svc.cluster.local",
            "outbound|9090||foo.ns-0.svc.cluster.local",
        ]
    );
}

#[test]
fn removed_port_is_deleted() {
    let test = TestConfig::default();
    let foo = Arc::new(mk_service("foo", "ns-0", [(80, Protocol::Http)]));
    let proxy = mk_sidecar(vec![foo], vec![]);
    let push = Arc::new(mk_push("2"));

    let req = mk_delta(&push, [ConfigKey::new(Kind::ServiceEntry, FOO, "ns-0")]);
    let rsp = build_delta(
        &test,
        &proxy,
        &req,
        &[
            "outbound|80||foo.ns-0.svc.cluster.local",
            "outbound|81||foo.ns-0.svc.cluster.local",
        ],
    );

    assert!(names(&rsp).contains(&"outbound|80||foo.ns-0.svc.cluster.local"));
    assert_eq!(rsp.removed, vec!["outbound|81||foo.ns-0.svc.cluster.local"]);
    assert_disjoint(&rsp);
}

#[test]
fn replaced_subset_is_removed() {
    let test = TestConfig::default();
    let foo = Arc::new(mk_service("foo", "ns-0", [(80, Protocol::Http)]));
    let prev = mk_scope(vec![foo.clone()], vec![mk_subsets_rule("1", &["v1"])]);
    let mut proxy = mk_sidecar(vec![foo], vec![mk_subsets_rule("2", &["v2"])]);
    proxy.prev_sidecar_scope = Some(prev);
    let push = Arc::new(mk_push("2"));

    let req = mk_delta(&push, [ConfigKey::new(Kind::DestinationRule, "foo", "ns-0")]);
    let rsp = build_delta(
        &test,
        &proxy,
        &req,
        &[
            "outbound|80||foo.ns-0.svc.cluster.local",
            "outbound|80|v1|foo.ns-0.svc.cluster.local",
        ],
    );

    let built = names(&rsp);
    assert!(built.contains(&"outbound|80||foo.ns-0.svc.cluster.local"));
    assert!(built.contains(&"outbound|80|v2|foo.ns-0.svc.cluster.local"));
    assert_eq!(rsp.removed, vec!["outbound|80|v1|foo.ns-0.svc.cluster.local"]);
    assert_disjoint(&rsp);
}

#[test]
fn kept_subset_is_not_removed() {
    let test = TestConfig::default();
    let foo = Arc::new(mk_service("foo", "ns-0", [(80, Protocol::Http)]));
    let proxy = mk_sidecar(vec![foo], vec![mk_subsets_rule("2", &["v1", "v2"])]);
    let push = Arc::new(mk_push("2"));

    let req = mk_delta(&push, [ConfigKey::new(Kind::DestinationRule, "foo", "ns-0")]);
    let rsp = build_delta(
        &test,
        &proxy,
        &req,
        &[
            "outbound|80||foo.ns-0.svc.cluster.local",
            "outbound|80|v1|foo.ns-0.svc.cluster.local",
        ],
    );
    assert!(rsp.removed.is_empty());
    assert!(names(&rsp).contains(&"outbound|80|v1|foo.ns-0.svc.cluster.local"));
}

#[test]
fn deleted_rule_rebuilds_previous_host() {
    let test = TestConfig::default();
    let foo = Arc::new(mk_service("foo", "ns-0", [(80, Protocol::Http)]));
    let prev = mk_scope(vec![foo.clone()], vec![mk_subsets_rule("1", &["v1"])]);
    let mut proxy = mk_sidecar(vec![foo], vec![]);
    proxy.prev_sidecar_scope = Some(prev);
    let push = Arc::new(mk_push("2"));

    let req = mk_delta(&push, [ConfigKey::new(Kind::DestinationRule, "foo", "ns-0")]);
    let rsp = build_delta(
        &test,
        &proxy,
        &req,
        &[
            "outbound|80||foo.ns-0.svc.cluster.local",
            "outbound|80|v1|foo.ns-0.svc.cluster.local",
        ],
    );
    assert!(names(&rsp).contains(&"outbound|80||foo.ns-0.svc.cluster.local"));
    assert_eq!(rsp.removed, vec!["outbound|80|v1|foo.ns-0.svc.cluster.local"]);
}

#[test]
fn unknown_rule_changes_nothing() {
    let test = TestConfig::default();
    let foo = Arc::new(mk_service("foo", "ns-0", [(80, Protocol::Http)]));
    let proxy = mk_sidecar(vec![foo], vec![]);
    let push = Arc::new(mk_push("2"));

    let req = mk_delta(&push, [ConfigKey::new(Kind::DestinationRule, "gone", "ns-0")]);
    let rsp = build_delta(&test, &proxy, &req, &["outbound|80||foo.ns-0.svc.cluster.local"]);
    assert!(rsp.delta);
    assert!(rsp.removed.is_empty());
    assert!(!names(&rsp).contains(&"outbound|80||foo.ns-0.svc.cluster.local"));
}

#[test]
fn ineligible_changes_fall_back_to_full_push() {
    let test = TestConfig::default();
    let foo = Arc::new(mk_service("foo", "ns-0", [(80, Protocol::Http)]));
    let proxy = mk_sidecar(vec![foo], vec![]);
    let push = Arc::new(mk_push("2"));

    let req = mk_delta(
        &push,
        [
            ConfigKey::new(Kind::ServiceEntry, FOO, "ns-0"),
            ConfigKey::new(Kind::Sidecar, "default", "ns-0"),
        ],
    );
    let rsp = build_delta(&test, &proxy, &req, &["outbound|81||foo.ns-0.svc.cluster.local"]);
    assert!(!rsp.delta);
    assert!(rsp.removed.is_empty());
    assert_eq!(rsp.resources, test.build(&proxy, &push).resources);
}

/// Pushes `next` as a delta to a proxy holding every cluster of `prev`, and
/// asserts that the clusters it holds afterwards are exactly those a full push
/// of `next` generates.
fn assert_delta_converges(
    prev: Arc<SidecarScope>,
    next: Arc<SidecarScope>,
    keys: impl IntoIterator<Item = ConfigKey>,
) {
    let test = TestConfig::default();
    let prev_push = Arc::new(mk_push("1"));
    let held = test.build(&mk_proxy(NodeType::Sidecar, prev.clone()), &prev_push);
    let watched = names(&held);

    let mut proxy = mk_proxy(NodeType::Sidecar, next);
    proxy.prev_sidecar_scope = Some(prev);
    let push = Arc::new(mk_push("2"));
    let full = test.build(&proxy, &push);

    let req = mk_delta(&push, keys);
    let rsp = build_delta(&test, &proxy, &req, &watched);
    assert!(rsp.delta);
    assert_disjoint(&rsp);

    let built = names(&rsp);
    let mut kept = watched
        .iter()
        .copied()
        .filter(|n| !rsp.removed.iter().any(|r| r.as_str() == *n) && !built.contains(n))
        .collect::<BTreeSet<_>>();
    kept.extend(built.iter().copied());
    assert_eq!(kept, names(&full).into_iter().collect::<BTreeSet<_>>());
}

fn mk_foo(ports: &[u16]) -> Arc<Service> {
    Arc::new(mk_service(
        "foo",
        "ns-0",
        ports.iter().map(|p| (*p, Protocol::Http)).collect::<Vec<_>>(),
    ))
}

fn mk_bar() -> Arc<Service> {
    Arc::new(mk_service("bar", "ns-0", [(80, Protocol::Http)]))
}

#[test]
fn service_changes_converge_with_full_push() {
    let se = |host: &str| [ConfigKey::new(Kind::ServiceEntry, host, "ns-0")];

    // Added.
    assert_delta_converges(
        mk_scope(vec![mk_foo(&[80])], vec![]),
        mk_scope(vec![mk_foo(&[80]), mk_bar()], vec![]),
        se(BAR),
    );
    // Deleted, along with its subsets.
    assert_delta_converges(
        mk_scope(vec![mk_foo(&[80]), mk_bar()], vec![mk_rule("1", BAR, &["v1"])]),
        mk_scope(vec![mk_foo(&[80])], vec![mk_rule("1", BAR, &["v1"])]),
        se(BAR),
    );
    // A port removed.
    assert_delta_converges(
        mk_scope(vec![mk_foo(&[80, 81])], vec![mk_rule("1", FOO, &["v1"])]),
        mk_scope(vec![mk_foo(&[80])], vec![mk_rule("1", FOO, &["v1"])]),
        se(FOO),
    );
}

#[test]
fn rule_changes_converge_with_full_push() {
    let dr = || [ConfigKey::new(Kind::DestinationRule, "foo", "ns-0")];
    let services = || vec![mk_foo(&[80, 81]), mk_bar()];

    // Added.
    assert_delta_converges(
        mk_scope(services(), vec![]),
        mk_scope(services(), vec![mk_rule("1", FOO, &["v1"])]),
        dr(),
    );
    // Subsets replaced.
    assert_delta_converges(
        mk_scope(services(), vec![mk_rule("1", FOO, &["v1", "v2"])]),
        mk_scope(services(), vec![mk_rule("2", FOO, &["v2", "v3"])]),
        dr(),
    );
    // Deleted.
    assert_delta_converges(
        mk_scope(services(), vec![mk_rule("1", FOO, &["v1"])]),
        mk_scope(services(), vec![]),
        dr(),
    );
    // Moved to another host.
    assert_delta_converges(
        mk_scope(services(), vec![mk_rule("1", FOO, &["v1"])]),
        mk_scope(services(), vec![mk_rule("2", BAR, &["v1"])]),
        dr(),
    );
}

#[test]
fn mixed_changes_converge_with_full_push() {
    assert_delta_converges(
        mk_scope(vec![mk_foo(&[80, 81]), mk_bar()], vec![mk_rule("1", FOO, &["v1"])]),
        mk_scope(vec![mk_foo(&[80])], vec![mk_rule("2", FOO, &["v2"])]),
        [
            ConfigKey::new(Kind::ServiceEntry, FOO, "ns-0"),
            ConfigKey::new(Kind::ServiceEntry, BAR, "ns-0"),
            ConfigKey::new(Kind::DestinationRule, "foo", "ns-0"),
        ],
    );
}
