mod delta;

use crate::{resource::Cluster, ClusterResponse, ConfigGenerator};
use maplit::*;
use mesh_cds_controller_core::{
    config::ConfigSpec,
    destination::DestinationPolicy,
    proxy::SidecarScope,
    service::{Endpoint, ServiceAttributes},
    Config, ConfigMeta, Features, MeshConfig, NodeType, Port, Protocol, Proxy, PushContext,
    PushRequest, Service, ServiceInstance,
};
use std::{collections::BTreeMap, sync::Arc};

struct TestConfig {
    generator: ConfigGenerator,
    _tracing: tracing::subscriber::DefaultGuard,
}

// === impl TestConfig ===

impl TestConfig {
    fn from_features(features: Features) -> Self {
        let _tracing = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::TRACE)
                .finish(),
        );
        Self {
            generator: ConfigGenerator::new(features),
            _tracing,
        }
    }

    fn build(&self, proxy: &Proxy, push: &Arc<PushContext>) -> ClusterResponse {
        self.generator
            .build_clusters(proxy, &PushRequest::full(push.clone()))
            .expect("clusters must build")
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::from_features(Features::default())
    }
}

fn mk_port(port: u16, protocol: Protocol) -> Port {
    let name = match protocol {
        Protocol::Http => format!("http-{port}"),
        Protocol::Redis => format!("redis-{port}"),
        _ => format!("tcp-{port}"),
    };
    Port {
        name,
        port,
        protocol,
    }
}

fn mk_service(
    name: &str,
    ns: &str,
    ports: impl IntoIterator<Item = (u16, Protocol)>,
) -> Service {
    Service {
        hostname: format!("{name}.{ns}.svc.cluster.local"),
        ports: ports.into_iter().map(|(p, proto)| mk_port(p, proto)).collect(),
        attributes: ServiceAttributes {
            name: name.to_string(),
            namespace: ns.to_string(),
            ..Default::default()
        },
        revision: "1".to_string(),
        ..Default::default()
    }
}

fn mk_instance(
    service: &Arc<Service>,
    port: u16,
    address: &str,
    endpoint_port: u16,
    labels: BTreeMap<String, String>,
) -> ServiceInstance {
    let service_port = service
        .port(port)
        .cloned()
        .expect("service must expose the port");
    ServiceInstance {
        service: service.clone(),
        service_port,
        endpoint: Endpoint {
            address: address.to_string(),
            endpoint_port,
            labels,
            ..Default::default()
        },
    }
}

fn mk_dest_rule(name: &str, ns: &str, revision: &str, policy: DestinationPolicy) -> Arc<Config> {
    Arc::new(Config {
        meta: ConfigMeta {
            name: name.to_string(),
            namespace: ns.to_string(),
            revision: revision.to_string(),
        },
        spec: ConfigSpec::DestinationRule(policy),
    })
}

fn mk_scope(services: Vec<Arc<Service>>, destination_rules: Vec<Arc<Config>>) -> Arc<SidecarScope> {
    Arc::new(SidecarScope {
        name: "default".to_string(),
        namespace: "ns-0".to_string(),
        services,
        destination_rules,
        ..Default::default()
    })
}

fn mk_proxy(node_type: NodeType, scope: Arc<SidecarScope>) -> Proxy {
    Proxy {
        id: "proxy-0.ns-0".to_string(),
        node_type,
        namespace: "ns-0".to_string(),
        cluster_id: "cluster-0".to_string(),
        ip_addresses: vec!["10.0.0.1".to_string()],
        sidecar_scope: scope,
        ..Default::default()
    }
}

fn mk_sidecar(services: Vec<Arc<Service>>, destination_rules: Vec<Arc<Config>>) -> Proxy {
    mk_proxy(NodeType::Sidecar, mk_scope(services, destination_rules))
}

fn mk_push(version: &str) -> PushContext {
    PushContext::new(version, MeshConfig::default())
}

fn names(rsp: &ClusterResponse) -> Vec<&str> {
    rsp.resources.iter().map(|r| r.name.as_str()).collect()
}

fn cluster(rsp: &ClusterResponse, name: &str) -> Cluster {
    rsp.resources
        .iter()
        .find(|r| r.name == name)
        .unwrap_or_else(|| panic!("{name} must be generated"))
        .decode()
        .expect("cluster must decode")
}

fn labels(version: &str) -> BTreeMap<String, String> {
    btreemap! { "version".to_string() => version.to_string() }
}
