use crate::{
    config::ConfigKey,
    mesh::MeshConfig,
    patch::{EnvoyFilter, PatchRuleSet},
    proxy::Proxy,
    service::{MutualTlsMode, Service, ServiceInstance},
};
use ahash::AHashMap as HashMap;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Services are attached to a waypoint by this label, naming the waypoint's
/// gateway.
pub const USE_WAYPOINT_LABEL: &str = "istio.io/use-waypoint";

/// The label that names the gateway a waypoint proxy implements.
pub const GATEWAY_NAME_LABEL: &str = "gateway.networking.k8s.io/gateway-name";

/// An immutable view of the mesh for one generation.
#[derive(Clone, Debug, Default)]
pub struct PushContext {
    /// Identifies the generation.
    pub version: String,
    pub mesh: MeshConfig,
    pub envoy_filters: Vec<EnvoyFilter>,

    /// The mTLS modes inferred from authentication policy, by hostname.
    pub service_mtls_modes: BTreeMap<String, MutualTlsMode>,

    /// Hostnames each service sends traffic to, by hostname.
    pub service_references: BTreeMap<String, BTreeSet<String>>,
    instances: HashMap<String, Vec<ServiceInstance>>,
}

/// A request to generate configuration for one proxy.
#[derive(Clone, Debug)]
pub struct PushRequest {
    pub push: Arc<PushContext>,

    /// The configs that changed since the proxy's last push. Empty for a full
    /// push.
    pub configs_updated: BTreeSet<ConfigKey>,
}

/// The resource names a proxy currently holds.
#[derive(Clone, Debug, Default)]
pub struct WatchedResource {
    pub resource_names: BTreeSet<String>,
}

// === impl PushContext ===

impl PushContext {
    pub fn new(version: impl ToString, mesh: MeshConfig) -> Self {
        Self {
            version: version.to_string(),
            mesh,
            ..Default::default()
        }
    }

    pub fn add_instance(&mut self, instance: ServiceInstance) {
        self.instances
            .entry(instance.service.hostname.clone())
            .or_default()
            .push(instance);
    }

    /// Returns the instances of `service` serving `port` whose labels include
    /// `labels`.
    pub fn service_instances_by_port(
        &self,
        service: &Service,
        port: u16,
        labels: Option<&BTreeMap<String, String>>,
    ) -> Vec<&ServiceInstance> {
        let Some(instances) = self.instances.get(&service.hostname) else {
            return Vec::new();
        };
        instances
            .iter()
            .filter(|i| {
                i.service.attributes.namespace == service.attributes.namespace
                    && i.service_port.port == port
                    && labels.map(|l| i.endpoint.matches_labels(l)).unwrap_or(true)
            })
            .collect()
    }

    /// Returns the cluster patches that apply to `proxy`, if any. Filters in
    /// the root namespace apply to every proxy; others only to proxies in
    /// their own namespace.
    pub fn envoy_filters(&self, proxy: &Proxy) -> Option<PatchRuleSet> {
        let rules = PatchRuleSet::from_filters(self.envoy_filters.iter().filter(|f| {
            (f.namespace == self.mesh.root_namespace || f.namespace == proxy.namespace)
                && f.selects(&proxy.labels)
        }));
        if rules.is_empty() {
            return None;
        }
        Some(rules)
    }

    pub fn best_effort_infer_service_mtls_mode(&self, service: &Service) -> MutualTlsMode {
        if service.mesh_external {
            return MutualTlsMode::Disable;
        }
        self.service_mtls_modes
            .get(&service.hostname)
            .copied()
            .unwrap_or(MutualTlsMode::Permissive)
    }

    /// Returns the services referenced by the gateways merged into a router.
    pub fn gateway_services(&self, proxy: &Proxy) -> Vec<Arc<Service>> {
        let Some(gateway) = proxy.merged_gateway.as_ref() else {
            return Vec::new();
        };
        proxy
            .sidecar_scope
            .services
            .iter()
            .filter(|s| gateway.hosts.contains(&s.hostname))
            .cloned()
            .collect()
    }

    /// Returns the services a waypoint serves: those in its namespace that
    /// name its gateway in their `use-waypoint` label.
    pub fn services_for_waypoint(&self, proxy: &Proxy) -> Vec<Arc<Service>> {
        let Some(gateway) = proxy.labels.get(GATEWAY_NAME_LABEL) else {
            return Vec::new();
        };
        proxy
            .sidecar_scope
            .services
            .iter()
            .filter(|s| {
                s.attributes.namespace == proxy.namespace
                    && s.attributes.labels.get(USE_WAYPOINT_LABEL) == Some(gateway)
            })
            .cloned()
            .collect()
    }
}

// === impl PushRequest ===

impl PushRequest {
    pub fn full(push: Arc<PushContext>) -> Self {
        Self {
            push,
            configs_updated: BTreeSet::new(),
        }
    }
}

// === impl WatchedResource ===

impl WatchedResource {
    pub fn new(names: impl IntoIterator<Item = impl ToString>) -> Self {
        Self {
            resource_names: names.into_iter().map(|n| n.to_string()).collect(),
        }
    }
}
