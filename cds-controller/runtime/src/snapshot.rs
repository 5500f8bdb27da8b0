use crate::core::{
    config::ConfigSpec,
    destination::{ConnectionPool, DestinationPolicy},
    patch::EnvoyFilter,
    proxy::{IngressListener, InterceptionMode, Locality, MergedGateway, ProxyView, SidecarScope},
    service::{host_matches, Endpoint, MutualTlsMode},
    Config, ConfigKey, ConfigMeta, MeshConfig, NodeType, Proxy, PushContext, Service,
    ServiceInstance, WatchedResource,
};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Arc,
};

/// A point-in-time export of the mesh model and of the proxies connected to
/// it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub version: String,
    pub mesh: MeshConfig,
    pub services: Vec<Service>,
    pub destination_rules: Vec<DestinationRule>,
    pub envoy_filters: Vec<EnvoyFilter>,
    pub endpoints: Vec<EndpointSpec>,
    pub service_mtls_modes: BTreeMap<String, MutualTlsMode>,
    pub service_references: BTreeMap<String, BTreeSet<String>>,

    /// The configs that changed since the proxies' last push. Proxies that
    /// report the clusters they hold receive a delta push.
    pub configs_updated: BTreeSet<ConfigKey>,
    pub proxies: Vec<ProxySpec>,
}

#[derive(Debug, Deserialize)]
pub struct DestinationRule {
    #[serde(flatten)]
    pub meta: ConfigMeta,
    pub spec: DestinationPolicy,
}

/// An endpoint serving a port of a service.
#[derive(Debug, Deserialize)]
pub struct EndpointSpec {
    /// The service's hostname.
    pub service: String,

    /// The service port the endpoint serves.
    pub port: u16,

    #[serde(flatten)]
    pub endpoint: Endpoint,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProxySpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub namespace: String,
    pub cluster_id: String,
    pub ip_addresses: Vec<String>,

    /// A `region/zone/subzone` label.
    pub locality: String,
    pub labels: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub interception_mode: InterceptionMode,

    /// The networks the proxy can reach. Omitted reaches every network.
    pub networks: Option<Vec<String>>,

    /// The endpoints of the workload the proxy runs beside.
    pub endpoints: Vec<EndpointSpec>,
    pub sidecar: SidecarSpec,

    /// The sidecar the proxy was last pushed with, if it changed since.
    pub previous_sidecar: Option<SidecarSpec>,
    pub merged_gateway: Option<MergedGateway>,
    pub enable_hbone: bool,

    /// The clusters the proxy holds.
    pub watched: Option<BTreeSet<String>>,
}

/// Limits the services a proxy sees.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SidecarSpec {
    pub name: String,

    /// Hostname patterns, e.g. `*.ns.svc.cluster.local`.
    pub hosts: Vec<String>,
    pub ingress: Vec<IngressListener>,
    pub inbound_connection_pool: Option<ConnectionPool>,
}

/// The mesh model a snapshot describes.
#[derive(Debug)]
pub struct Model {
    pub push: Arc<PushContext>,
    pub configs_updated: BTreeSet<ConfigKey>,
    pub proxies: Vec<ProxyModel>,
}

#[derive(Debug)]
pub struct ProxyModel {
    pub proxy: Proxy,
    pub watched: Option<WatchedResource>,
}

// === impl Snapshot ===

impl Snapshot {
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("invalid snapshot {}", path.display()))
    }

    pub fn into_model(self) -> Result<Model> {
        let Self {
            version,
            mesh,
            services,
            destination_rules,
            envoy_filters,
            endpoints,
            service_mtls_modes,
            service_references,
            configs_updated,
            proxies,
        } = self;

        let services = services.into_iter().map(Arc::new).collect::<Vec<_>>();
        let destination_rules = destination_rules
            .into_iter()
            .map(|DestinationRule { meta, spec }| {
                Arc::new(Config {
                    meta,
                    spec: ConfigSpec::DestinationRule(spec),
                })
            })
            .collect::<Vec<_>>();

        let mut push = PushContext::new(version, mesh);
        push.envoy_filters = envoy_filters;
        push.service_mtls_modes = service_mtls_modes;
        push.service_references = service_references;
        for endpoint in endpoints {
            push.add_instance(endpoint.into_instance(&services)?);
        }

        let proxies = proxies
            .into_iter()
            .map(|p| p.into_model(&services, &destination_rules))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            version = %push.version,
            services = services.len(),
            destination_rules = destination_rules.len(),
            proxies = proxies.len(),
            "Loaded snapshot"
        );
        Ok(Model {
            push: Arc::new(push),
            configs_updated,
            proxies,
        })
    }
}

// === impl EndpointSpec ===

impl EndpointSpec {
    fn into_instance(self, services: &[Arc<Service>]) -> Result<ServiceInstance> {
        let Some(service) = services.iter().find(|s| s.hostname == self.service) else {
            bail!(
                "endpoint {} references unknown service {}",
                self.endpoint.address,
                self.service
            );
        };
        let service_port = service
            .port(self.port)
            .with_context(|| format!("service {} has no port {}", self.service, self.port))?
            .clone();
        Ok(ServiceInstance {
            service: service.clone(),
            service_port,
            endpoint: self.endpoint,
        })
    }
}

// === impl ProxySpec ===

impl ProxySpec {
    fn into_model(self, services: &[Arc<Service>], destination_rules: &[Arc<Config>]) -> Result<ProxyModel> {
        let Self {
            id,
            node_type,
            namespace,
            cluster_id,
            ip_addresses,
            locality,
            labels,
            metadata,
            interception_mode,
            networks,
            endpoints,
            sidecar,
            previous_sidecar,
            merged_gateway,
            enable_hbone,
            watched,
        } = self;

        let service_instances = endpoints
            .into_iter()
            .map(|ep| ep.into_instance(services))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("invalid endpoints for proxy {id}"))?;

        let proxy = Proxy {
            sidecar_scope: Arc::new(sidecar.into_scope(&namespace, services, destination_rules)),
            prev_sidecar_scope: previous_sidecar
                .map(|s| Arc::new(s.into_scope(&namespace, services, destination_rules))),
            id,
            node_type,
            namespace,
            cluster_id,
            ip_addresses,
            locality: Locality::parse(&locality),
            labels,
            metadata,
            interception_mode,
            view: networks.map(ProxyView::networks).unwrap_or_else(ProxyView::all),
            service_instances,
            merged_gateway,
            enable_hbone,
        };
        Ok(ProxyModel {
            proxy,
            watched: watched.map(WatchedResource::new),
        })
    }
}

// === impl SidecarSpec ===

impl Default for SidecarSpec {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            hosts: vec!["*".to_string()],
            ingress: Vec::new(),
            inbound_connection_pool: None,
        }
    }
}

impl SidecarSpec {
    fn into_scope(
        self,
        namespace: &str,
        services: &[Arc<Service>],
        destination_rules: &[Arc<Config>],
    ) -> SidecarScope {
        let services = services
            .iter()
            .filter(|s| self.hosts.iter().any(|h| host_matches(h, &s.hostname)))
            .cloned()
            .collect();
        SidecarScope {
            name: self.name,
            namespace: namespace.to_string(),
            services,
            destination_rules: destination_rules.to_vec(),
            ingress: self.ingress,
            inbound_connection_pool: self.inbound_connection_pool,
        }
    }
}

// === impl Model ===

impl Model {
    /// Drops every proxy not named in `ids`. An empty list keeps all proxies.
    pub fn retain_proxies(&mut self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        for id in ids {
            if !self.proxies.iter().any(|p| &p.proxy.id == id) {
                bail!("snapshot has no proxy {id}");
            }
        }
        self.proxies.retain(|p| ids.contains(&p.proxy.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Protocol;
    use serde_json::json;

    fn mk_snapshot() -> serde_json::Value {
        json!({
            "version": "7",
            "services": [
                {
                    "hostname": "foo.ns-0.svc.cluster.local",
                    "ports": [{ "name": "http", "port": 80, "protocol": "HTTP" }],
                    "attributes": { "name": "foo", "namespace": "ns-0" },
                },
                {
                    "hostname": "bar.ns-1.svc.cluster.local",
                    "ports": [{ "name": "tcp", "port": 9090, "protocol": "TCP" }],
                    "attributes": { "name": "bar", "namespace": "ns-1" },
                },
            ],
            "destination_rules": [{
                "name": "foo",
                "namespace": "ns-0",
                "revision": "3",
                "spec": { "host": "foo.ns-0.svc.cluster.local" },
            }],
            "endpoints": [{
                "service": "foo.ns-0.svc.cluster.local",
                "port": 80,
                "address": "10.0.0.1",
                "endpoint_port": 8080,
            }],
            "configs_updated": [
                { "kind": "DestinationRule", "name": "foo", "namespace": "ns-0" },
            ],
            "proxies": [
                {
                    "id": "foo-0.ns-0",
                    "namespace": "ns-0",
                    "ip_addresses": ["10.0.0.1"],
                    "locality": "us-east/us-east-1a",
                    "networks": ["net-0"],
                    "endpoints": [{
                        "service": "foo.ns-0.svc.cluster.local",
                        "port": 80,
                        "address": "10.0.0.1",
                        "endpoint_port": 8080,
                    }],
                    "sidecar": { "hosts": ["*.ns-0.svc.cluster.local"] },
                    "watched": ["outbound|80||foo.ns-0.svc.cluster.local"],
                },
                {
                    "id": "gateway-0.ns-1",
                    "type": "router",
                    "namespace": "ns-1",
                },
            ],
        })
    }

    fn mk_model(snapshot: serde_json::Value) -> Result<Model> {
        serde_json::from_value::<Snapshot>(snapshot)
            .expect("snapshot must parse")
            .into_model()
    }

    #[test]
    fn builds_model() {
        let model = mk_model(mk_snapshot()).expect("snapshot must be valid");
        assert_eq!(model.push.version, "7");
        assert_eq!(
            model.configs_updated.into_iter().collect::<Vec<_>>(),
            vec![ConfigKey::new(crate::core::Kind::DestinationRule, "foo", "ns-0")]
        );

        let [sidecar, gateway] = &model.proxies[..] else {
            panic!("expected two proxies");
        };

        let proxy = &sidecar.proxy;
        assert_eq!(proxy.node_type, NodeType::Sidecar);
        assert_eq!(proxy.locality, Locality::parse("us-east/us-east-1a"));
        assert!(proxy.view.is_visible("net-0"));
        assert!(!proxy.view.is_visible("net-1"));
        assert_eq!(proxy.service_instances.len(), 1);
        assert_eq!(proxy.service_instances[0].service_port.protocol, Protocol::Http);
        assert_eq!(proxy.service_instances[0].endpoint.endpoint_port, 8080);
        assert_eq!(
            proxy
                .sidecar_scope
                .services
                .iter()
                .map(|s| s.hostname.as_str())
                .collect::<Vec<_>>(),
            vec!["foo.ns-0.svc.cluster.local"]
        );
        let rule = proxy
            .sidecar_scope
            .destination_rule("foo.ns-0.svc.cluster.local")
            .expect("rule must be a destination rule")
            .expect("rule must be visible");
        assert_eq!(rule.meta.revision, "3");
        assert_eq!(
            sidecar.watched.as_ref().map(|w| w.resource_names.len()),
            Some(1)
        );

        let proxy = &gateway.proxy;
        assert_eq!(proxy.node_type, NodeType::Router);
        assert_eq!(proxy.sidecar_scope.name, "default");
        assert_eq!(proxy.sidecar_scope.services.len(), 2);
        assert!(proxy.view.is_visible("net-1"));
        assert!(gateway.watched.is_none());
    }

    #[test]
    fn endpoints_load_into_push() {
        let model = mk_model(mk_snapshot()).expect("snapshot must be valid");
        let foo = model.proxies[0].proxy.sidecar_scope.services[0].clone();
        let instances = model.push.service_instances_by_port(&foo, 80, None);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].endpoint.address, "10.0.0.1");
    }

    #[test]
    fn unknown_services_are_rejected() {
        let mut snapshot = mk_snapshot();
        snapshot["endpoints"][0]["service"] = json!("baz.ns-0.svc.cluster.local");
        let error = mk_model(snapshot).expect_err("endpoint must be rejected");
        assert!(error.to_string().contains("unknown service"), "{error}");
    }

    #[test]
    fn unknown_ports_are_rejected() {
        let mut snapshot = mk_snapshot();
        snapshot["proxies"][0]["endpoints"][0]["port"] = json!(81);
        let error = mk_model(snapshot).expect_err("endpoint must be rejected");
        assert!(format!("{error:#}").contains("has no port 81"), "{error:#}");
    }

    #[test]
    fn retains_named_proxies() {
        let mut model = mk_model(mk_snapshot()).expect("snapshot must be valid");
        model.retain_proxies(&[]).expect("empty selection keeps all");
        assert_eq!(model.proxies.len(), 2);

        model
            .retain_proxies(&["gateway-0.ns-1".to_string()])
            .expect("proxy must exist");
        assert_eq!(model.proxies.len(), 1);
        assert_eq!(model.proxies[0].proxy.id, "gateway-0.ns-1");

        assert!(model.retain_proxies(&["missing".to_string()]).is_err());
    }
}
