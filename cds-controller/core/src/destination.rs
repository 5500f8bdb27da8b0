//! Destination policies ("destination rules") configure how traffic to a host
//! is load balanced, secured and ejected.

use crate::{duration, service::Port};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationPolicy {
    /// The host this policy applies to. May be a `*.suffix` wildcard.
    pub host: String,
    pub traffic_policy: Option<TrafficPolicy>,
    pub subsets: Vec<Subset>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficPolicy {
    pub connection_pool: Option<ConnectionPool>,
    pub outlier_detection: Option<OutlierDetection>,
    pub load_balancer: Option<LoadBalancer>,
    pub tls: Option<ClientTls>,
    pub port_level_settings: Vec<PortTrafficPolicy>,
}

/// Settings that apply to a single port, replacing the destination-level
/// settings for it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortTrafficPolicy {
    pub port: u16,
    pub connection_pool: Option<ConnectionPool>,
    pub outlier_detection: Option<OutlierDetection>,
    pub load_balancer: Option<LoadBalancer>,
    pub tls: Option<ClientTls>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subset {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub traffic_policy: Option<TrafficPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPool {
    pub tcp: Option<TcpSettings>,
    pub http: Option<HttpSettings>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    pub max_connections: Option<u32>,
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<Duration>,
    pub tcp_keepalive: Option<TcpKeepalive>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpKeepalive {
    /// Zero leaves the probe count unset.
    pub probes: u32,
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub time: Option<Duration>,
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub http1_max_pending_requests: Option<u32>,
    pub http2_max_requests: Option<u32>,
    pub max_requests_per_connection: Option<u32>,
    pub max_retries: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierDetection {
    pub consecutive_5xx_errors: Option<u32>,
    pub consecutive_gateway_errors: Option<u32>,
    pub consecutive_local_origin_failures: Option<u32>,
    pub split_external_local_origin_errors: bool,
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub base_ejection_time: Option<Duration>,
    pub max_ejection_percent: i32,

    /// Negative values leave the panic threshold unset. Zero cannot be told
    /// apart from an unset value and is applied as given.
    pub min_health_percent: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancer {
    pub simple: Option<SimpleLb>,
    pub consistent_hash: Option<ConsistentHash>,
    pub locality_lb_setting: Option<LocalityLbSetting>,
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub warmup_duration: Option<Duration>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimpleLb {
    LeastConn,
    Random,
    Passthrough,
    RoundRobin,
    LeastRequest,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistentHash {
    /// Deprecated in favor of `algorithm`.
    pub minimum_ring_size: u64,
    pub algorithm: Option<HashAlgorithm>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    RingHash { minimum_ring_size: u64 },
    Maglev { table_size: u64 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalityLbSetting {
    pub distribute: Vec<LocalityDistribute>,
    pub failover: Vec<LocalityFailover>,
    pub enabled: Option<bool>,
}

/// Sends traffic originating in `from` to the `to` localities in proportion
/// to their weights.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalityDistribute {
    pub from: String,
    pub to: BTreeMap<String, u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalityFailover {
    pub from: String,
    pub to: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTls {
    pub mode: TlsMode,
    pub client_certificate: String,
    pub private_key: String,
    pub ca_certificates: String,
    pub credential_name: String,
    pub subject_alt_names: Vec<String>,
    pub sni: String,
    pub insecure_skip_verify: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TlsMode {
    #[default]
    Disable,
    Simple,
    Mutual,
    IstioMutual,
}

// === impl DestinationPolicy ===

impl DestinationPolicy {
    pub fn subset(&self, name: &str) -> Option<&Subset> {
        self.subsets.iter().find(|s| s.name == name)
    }
}

// === impl TrafficPolicy ===

impl TrafficPolicy {
    fn port_level(&self, port: u16) -> Option<&PortTrafficPolicy> {
        self.port_level_settings.iter().find(|p| p.port == port)
    }
}

/// Merges a subset policy over the destination-level policy and then selects
/// the settings for `port`.
///
/// Each component set on the subset replaces the destination's. A matching
/// port-level setting replaces all four components rather than inheriting any
/// of them. When a port is given, the result holds no port-level settings, so
/// it may itself be merged with a subset policy.
pub fn merge_traffic_policy(
    original: Option<&TrafficPolicy>,
    subset: Option<&TrafficPolicy>,
    port: Option<&Port>,
) -> Option<TrafficPolicy> {
    let mut merged = match (original, subset) {
        (None, None) => return None,
        (Some(p), None) | (None, Some(p)) => p.clone(),
        (Some(original), Some(subset)) => {
            let mut merged = original.clone();
            if subset.connection_pool.is_some() {
                merged.connection_pool = subset.connection_pool.clone();
            }
            if subset.outlier_detection.is_some() {
                merged.outlier_detection = subset.outlier_detection.clone();
            }
            if subset.load_balancer.is_some() {
                merged.load_balancer = subset.load_balancer.clone();
            }
            if subset.tls.is_some() {
                merged.tls = subset.tls.clone();
            }
            if !subset.port_level_settings.is_empty() {
                merged.port_level_settings = subset.port_level_settings.clone();
            }
            merged
        }
    };

    if let Some(port) = port {
        if let Some(settings) = merged.port_level(port.port).cloned() {
            merged.connection_pool = settings.connection_pool;
            merged.outlier_detection = settings.outlier_detection;
            merged.load_balancer = settings.load_balancer;
            merged.tls = settings.tls;
        }
        merged.port_level_settings.clear();
    }
    Some(merged)
}
