use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// A service discovered from a registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub hostname: String,
    pub ports: Vec<Port>,
    pub attributes: ServiceAttributes,
    pub resolution: Resolution,
    pub mesh_external: bool,
    pub service_accounts: Vec<String>,

    /// Changes whenever the service's definition changes.
    pub revision: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceAttributes {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub registry: Registry,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registry {
    #[default]
    Kubernetes,
    External,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Port {
    #[serde(default)]
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    Http,
    Http2,
    Grpc,
    GrpcWeb,
    Https,
    Tls,
    Tcp,
    Mongo,
    Redis,
    Mysql,
    Udp,
    #[default]
    Unsupported,
}

/// How a proxy discovers the endpoints of a service.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    #[default]
    ClientSideLb,
    DnsLb,
    DnsRoundRobinLb,
    Passthrough,
}

/// A workload endpoint backing a service port.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub address: String,
    pub endpoint_port: u16,
    pub labels: BTreeMap<String, String>,

    /// A `region/zone/subzone` locality label.
    pub locality: String,
    pub network: String,
    pub tls_mode: String,
    pub service_account: String,
    pub weight: u32,
}

/// Binds one service port to a concrete workload endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service: Arc<Service>,
    pub service_port: Port,
    pub endpoint: Endpoint,
}

/// A service port and the workload port it targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceTarget {
    pub service: Arc<Service>,
    pub port: ServiceInstancePort,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInstancePort {
    pub service_port: Port,
    pub target_port: u16,
}

/// The mTLS mode a destination accepts, as inferred from authentication
/// policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutualTlsMode {
    #[default]
    Unknown,
    Disable,
    Permissive,
    Strict,
}

// === impl Service ===

impl Service {
    pub fn port(&self, number: u16) -> Option<&Port> {
        self.ports.iter().find(|p| p.port == number)
    }

    /// Services in the Kubernetes registry are identified by their short
    /// `name.namespace` form in stats.
    pub fn short_name(&self) -> String {
        match self.attributes.registry {
            Registry::Kubernetes => {
                format!("{}.{}", self.attributes.name, self.attributes.namespace)
            }
            Registry::External => self.hostname.clone(),
        }
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn is_http2(&self) -> bool {
        matches!(self, Self::Http2 | Self::Grpc | Self::GrpcWeb)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http | Self::Http2 | Self::Grpc | Self::GrpcWeb)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Http2 => "HTTP2",
            Self::Grpc => "GRPC",
            Self::GrpcWeb => "GRPC-Web",
            Self::Https => "HTTPS",
            Self::Tls => "TLS",
            Self::Tcp => "TCP",
            Self::Mongo => "Mongo",
            Self::Redis => "Redis",
            Self::Mysql => "MySQL",
            Self::Udp => "UDP",
            Self::Unsupported => "UnsupportedProtocol",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Endpoint ===

impl Endpoint {
    /// Returns true if every label in `selector` is set on the endpoint.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|l| l == v).unwrap_or(false))
    }
}

/// Returns true if `pattern` selects `hostname`. A pattern may be `*` or a
/// `*.suffix` wildcard.
pub fn host_matches(pattern: &str, hostname: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix('*') {
        Some(suffix) => hostname.ends_with(suffix),
        None => pattern == hostname,
    }
}
