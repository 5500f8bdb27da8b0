use crate::{
    config::{Config, Error},
    destination::ConnectionPool,
    service::{host_matches, Port, Service, ServiceInstance, ServiceInstancePort, ServiceTarget},
    CREDENTIAL_META_DATA,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    net::IpAddr,
    sync::Arc,
};

/// The role a proxy plays in the mesh.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Sidecar,

    /// An ambient-mode proxy serving inbound traffic for a set of services.
    Waypoint,

    /// An ingress or egress gateway.
    Router,
}

/// How inbound traffic reaches a sidecar.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterceptionMode {
    #[default]
    Redirect,
    Tproxy,

    /// Traffic is not intercepted, so inbound clusters must be declared with
    /// explicit ingress listeners.
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IpMode {
    Ipv4,
    Ipv6,
    Dual,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(default)]
pub struct Locality {
    pub region: String,
    pub zone: String,
    pub subzone: String,
}

/// The networks whose endpoints a proxy can reach. `None` sees every network.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ProxyView {
    networks: Option<BTreeSet<String>>,
}

/// Declares a port on which a sidecar accepts inbound traffic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressListener {
    pub port: Port,

    /// Either `unix://path`, `host:port`, or empty for passthrough. The host
    /// may be one of the `0.0.0.0`, `[::]`, `127.0.0.1` or `[::1]`
    /// placeholders.
    pub default_endpoint: String,
    pub connection_pool: Option<ConnectionPool>,
}

/// The subset of the mesh visible to a proxy.
#[derive(Clone, Debug, Default)]
pub struct SidecarScope {
    pub name: String,
    pub namespace: String,
    pub services: Vec<Arc<Service>>,
    pub destination_rules: Vec<Arc<Config>>,
    pub ingress: Vec<IngressListener>,
    pub inbound_connection_pool: Option<ConnectionPool>,
}

/// The union of the gateways bound to a router.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergedGateway {
    pub contains_auto_passthrough_gateways: bool,

    /// Hosts referenced by the gateways' servers and routes.
    pub hosts: BTreeSet<String>,
}

#[derive(Clone, Debug, Default)]
pub struct Proxy {
    pub id: String,
    pub node_type: NodeType,
    pub namespace: String,
    pub cluster_id: String,
    pub ip_addresses: Vec<String>,
    pub locality: Locality,
    pub labels: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub interception_mode: InterceptionMode,
    pub view: ProxyView,
    pub service_instances: Vec<ServiceInstance>,
    pub sidecar_scope: Arc<SidecarScope>,

    /// The scope the proxy was last pushed with, if it changed since.
    pub prev_sidecar_scope: Option<Arc<SidecarScope>>,
    pub merged_gateway: Option<MergedGateway>,
    pub enable_hbone: bool,
}

// === impl Locality ===

impl Locality {
    /// Parses a `region/zone/subzone` label. Missing parts are empty.
    pub fn parse(label: &str) -> Self {
        let mut parts = label.splitn(3, '/');
        let mut next = || parts.next().unwrap_or_default().to_string();
        Self {
            region: next(),
            zone: next(),
            subzone: next(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty() && self.zone.is_empty() && self.subzone.is_empty()
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.zone, self.subzone)
    }
}

// === impl ProxyView ===

impl ProxyView {
    pub fn all() -> Self {
        Self { networks: None }
    }

    pub fn networks(networks: impl IntoIterator<Item = String>) -> Self {
        Self {
            networks: Some(networks.into_iter().collect()),
        }
    }

    /// Endpoints without a network are visible from everywhere.
    pub fn is_visible(&self, network: &str) -> bool {
        match &self.networks {
            None => true,
            Some(networks) => network.is_empty() || networks.contains(network),
        }
    }
}

// === impl SidecarScope ===

impl SidecarScope {
    pub fn service_for_hostname(&self, hostname: &str) -> Option<&Arc<Service>> {
        self.services.iter().find(|s| s.hostname == hostname)
    }

    /// Returns the services selected by a possibly-wildcarded host.
    pub fn services_for_hostname(&self, host: &str) -> Vec<Arc<Service>> {
        self.services
            .iter()
            .filter(|s| host_matches(host, &s.hostname))
            .cloned()
            .collect()
    }

    /// Returns the destination rule that most specifically selects
    /// `hostname`. An exact host wins over wildcards, and longer wildcards
    /// win over shorter ones.
    pub fn destination_rule(&self, hostname: &str) -> Result<Option<&Arc<Config>>, Error> {
        let mut best: Option<(&Arc<Config>, (bool, usize))> = None;
        for config in &self.destination_rules {
            let host = &config.destination_rule()?.host;
            if !host_matches(host, hostname) {
                continue;
            }
            let specificity = (host == hostname, host.len());
            if best.map(|(_, s)| specificity > s).unwrap_or(true) {
                best = Some((config, specificity));
            }
        }
        Ok(best.map(|(config, _)| config))
    }

    pub fn destination_rule_by_name(&self, name: &str, namespace: &str) -> Option<&Arc<Config>> {
        self.destination_rules
            .iter()
            .find(|c| c.meta.name == name && c.meta.namespace == namespace)
    }

    pub fn has_ingress_listeners(&self) -> bool {
        !self.ingress.is_empty()
    }

    /// A listener's own pool wins over the scope-wide inbound pool.
    pub fn inbound_connection_pool(&self, port: u16) -> Option<&ConnectionPool> {
        self.ingress
            .iter()
            .find(|l| l.port.port == port)
            .and_then(|l| l.connection_pool.as_ref())
            .or(self.inbound_connection_pool.as_ref())
    }
}

// === impl Proxy ===

impl Proxy {
    fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ip_addresses.iter().filter_map(|a| a.parse().ok())
    }

    pub fn first_ipv4(&self) -> Option<String> {
        self.addresses()
            .find(|a| a.is_ipv4())
            .map(|a| a.to_string())
    }

    pub fn first_ipv6(&self) -> Option<String> {
        self.addresses()
            .find(|a| a.is_ipv6())
            .map(|a| a.to_string())
    }

    pub fn ip_mode(&self) -> IpMode {
        let v4 = self.addresses().any(|a| a.is_ipv4());
        let v6 = self.addresses().any(|a| a.is_ipv6());
        match (v4, v6) {
            (true, true) => IpMode::Dual,
            (false, true) => IpMode::Ipv6,
            _ => IpMode::Ipv4,
        }
    }

    pub fn has_credential_socket(&self) -> bool {
        self.metadata
            .get(CREDENTIAL_META_DATA)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// The services and workload ports this proxy serves.
    pub fn service_targets(&self) -> Vec<ServiceTarget> {
        self.service_instances
            .iter()
            .map(|i| ServiceTarget {
                service: i.service.clone(),
                port: ServiceInstancePort {
                    service_port: i.service_port.clone(),
                    target_port: i.endpoint.endpoint_port,
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConfigMeta, ConfigSpec},
        destination::DestinationPolicy,
    };

    fn mk_rule(name: &str, host: &str) -> Arc<Config> {
        Arc::new(Config {
            meta: ConfigMeta {
                name: name.to_string(),
                namespace: "ns-0".to_string(),
                revision: "1".to_string(),
            },
            spec: ConfigSpec::DestinationRule(DestinationPolicy {
                host: host.to_string(),
                ..Default::default()
            }),
        })
    }

    #[test]
    fn parses_localities() {
        let l = Locality::parse("us-east/us-east-1a/rack-1");
        assert_eq!(l.region, "us-east");
        assert_eq!(l.zone, "us-east-1a");
        assert_eq!(l.subzone, "rack-1");
        assert_eq!(l.to_string(), "us-east/us-east-1a/rack-1");

        let l = Locality::parse("us-east");
        assert_eq!(l.zone, "");
        assert!(Locality::parse("").is_empty());
    }

    #[test]
    fn views() {
        assert!(ProxyView::all().is_visible("net-1"));
        let view = ProxyView::networks(vec!["net-1".to_string()]);
        assert!(view.is_visible("net-1"));
        assert!(view.is_visible(""));
        assert!(!view.is_visible("net-2"));
    }

    #[test]
    fn most_specific_destination_rule() {
        let scope = SidecarScope {
            destination_rules: vec![
                mk_rule("all", "*"),
                mk_rule("ns", "*.ns-0.svc.cluster.local"),
                mk_rule("exact", "foo.ns-0.svc.cluster.local"),
            ],
            ..Default::default()
        };
        let rule = scope
            .destination_rule("foo.ns-0.svc.cluster.local")
            .unwrap()
            .unwrap();
        assert_eq!(rule.meta.name, "exact");

        let rule = scope
            .destination_rule("bar.ns-0.svc.cluster.local")
            .unwrap()
            .unwrap();
        assert_eq!(rule.meta.name, "ns");

        let rule = scope.destination_rule("example.com").unwrap().unwrap();
        assert_eq!(rule.meta.name, "all");
    }

    #[test]
    fn destination_rule_lookup_rejects_other_kinds() {
        let scope = SidecarScope {
            destination_rules: vec![Arc::new(Config {
                meta: ConfigMeta::default(),
                spec: ConfigSpec::ServiceEntry(Service::default()),
            })],
            ..Default::default()
        };
        assert!(scope.destination_rule("foo").is_err());
    }

    #[test]
    fn ip_modes() {
        let mut proxy = Proxy {
            ip_addresses: vec!["10.0.0.1".to_string()],
            ..Default::default()
        };
        assert_eq!(proxy.ip_mode(), IpMode::Ipv4);
        proxy.ip_addresses.push("fd00::1".to_string());
        assert_eq!(proxy.ip_mode(), IpMode::Dual);
        assert_eq!(proxy.first_ipv6().as_deref(), Some("fd00::1"));
        proxy.ip_addresses.remove(0);
        assert_eq!(proxy.ip_mode(), IpMode::Ipv6);
        assert_eq!(proxy.first_ipv4(), None);
    }
}
