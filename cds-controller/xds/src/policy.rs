//! Translates traffic policy fragments into cluster fields.
//!
//! Each applier only touches the fields it owns, so they may run in any order
//! except where noted.

use crate::{
    locality,
    resource::{
        CircuitBreakers, Cluster, DiscoveryType, HttpProtocolOptions, LbConfig, LbPolicy,
        OutlierDetection, SlowStartConfig, TcpKeepalive, Thresholds,
    },
};
use mesh_cds_controller_core::{
    destination::{
        self as dr, ConnectionPool, HashAlgorithm, LoadBalancer, LocalityLbSetting, SimpleLb,
    },
    proxy::Locality,
    Features, MeshConfig, Port, Protocol,
};

const DEFAULT_MINIMUM_RING_SIZE: u64 = 1024;

/// Every limit defaults to the concurrency threshold except retries, which
/// are effectively unbounded.
pub fn default_thresholds(features: &Features) -> Thresholds {
    let threshold = features.default_upstream_concurrency_threshold;
    Thresholds {
        max_connections: threshold,
        max_pending_requests: threshold,
        max_requests: threshold,
        max_retries: u32::MAX,
        track_remaining: true,
    }
}

/// Sets the connect timeout, circuit breakers and keepalive of a cluster.
/// Fields present on `pool` override the defaults, even when zero.
pub fn apply_connection_pool(
    cluster: &mut Cluster,
    mesh: &MeshConfig,
    features: &Features,
    pool: Option<&ConnectionPool>,
) {
    let mut thresholds = default_thresholds(features);
    cluster.connect_timeout = Some(mesh.connect_timeout);

    if let Some(http) = pool.and_then(|p| p.http.as_ref()) {
        if let Some(max) = http.http2_max_requests {
            thresholds.max_requests = max;
        }
        if let Some(max) = http.http1_max_pending_requests {
            thresholds.max_pending_requests = max;
        }
        if let Some(max) = http.max_retries {
            thresholds.max_retries = max;
        }
        if http.idle_timeout.is_some() || http.max_requests_per_connection.is_some() {
            cluster.common_http_protocol_options = Some(HttpProtocolOptions {
                idle_timeout: http.idle_timeout,
                max_requests_per_connection: http.max_requests_per_connection,
            });
        }
        if let (Some(streams), Some(h2)) = (
            http.max_concurrent_streams,
            cluster.http2_protocol_options.as_mut(),
        ) {
            h2.max_concurrent_streams = Some(streams);
        }
    }

    let tcp = pool.and_then(|p| p.tcp.as_ref());
    if let Some(tcp) = tcp {
        if let Some(timeout) = tcp.connect_timeout {
            cluster.connect_timeout = Some(timeout);
        }
        if let Some(max) = tcp.max_connections {
            thresholds.max_connections = max;
        }
    }
    apply_tcp_keepalive(
        cluster,
        mesh.tcp_keepalive.as_ref(),
        tcp.and_then(|t| t.tcp_keepalive.as_ref()),
    );

    cluster.circuit_breakers = Some(CircuitBreakers {
        thresholds: vec![thresholds],
    });
}

/// Applies the mesh keepalive and then the destination's, which only
/// overrides the fields it sets.
pub fn apply_tcp_keepalive(
    cluster: &mut Cluster,
    mesh: Option<&dr::TcpKeepalive>,
    destination: Option<&dr::TcpKeepalive>,
) {
    for keepalive in [mesh, destination].into_iter().flatten() {
        let tcp = &mut cluster
            .upstream_connection_options
            .get_or_insert_with(Default::default)
            .tcp_keepalive;
        merge_keepalive(tcp, keepalive);
    }
}

fn merge_keepalive(tcp: &mut TcpKeepalive, keepalive: &dr::TcpKeepalive) {
    if keepalive.probes > 0 {
        tcp.keepalive_probes = Some(keepalive.probes);
    }
    if let Some(time) = keepalive.time {
        tcp.keepalive_time = Some(time.as_secs() as u32);
    }
    if let Some(interval) = keepalive.interval {
        tcp.keepalive_interval = Some(interval.as_secs() as u32);
    }
}

/// Configures ejection. Success-rate ejection is always disabled; a positive
/// consecutive-error threshold is fully enforced.
pub fn apply_outlier_detection(
    cluster: &mut Cluster,
    outlier: Option<&dr::OutlierDetection>,
    features: &Features,
) {
    let Some(outlier) = outlier else {
        return;
    };

    let enforcing = |v: u32| if v > 0 { 100 } else { 0 };
    let mut out = OutlierDetection {
        enforcing_success_rate: Some(0),
        ..Default::default()
    };
    if let Some(v) = outlier.consecutive_5xx_errors {
        out.consecutive_5xx = Some(v);
        out.enforcing_consecutive_5xx = Some(enforcing(v));
    }
    if let Some(v) = outlier.consecutive_gateway_errors {
        out.consecutive_gateway_failure = Some(v);
        out.enforcing_consecutive_gateway_failure = Some(enforcing(v));
    }
    out.interval = outlier.interval;
    out.base_ejection_time = outlier.base_ejection_time;
    if outlier.max_ejection_percent > 0 {
        out.max_ejection_percent = Some(outlier.max_ejection_percent as u32);
    }
    if outlier.split_external_local_origin_errors {
        out.split_external_local_origin_errors = true;
        if let Some(v) = outlier.consecutive_local_origin_failures.filter(|v| *v > 0) {
            out.consecutive_local_origin_failure = Some(v);
            out.enforcing_consecutive_local_origin_failure = Some(100);
        }
        out.enforcing_local_origin_success_rate = Some(0);
    }
    cluster.outlier_detection = Some(out);

    if outlier.min_health_percent >= 0 {
        let threshold = if features.send_unhealthy_endpoints {
            0
        } else {
            outlier.min_health_percent
        };
        cluster.common_lb_config.healthy_panic_threshold = Some(f64::from(threshold));
    }
}

/// Selects the LB policy. Must run after `apply_outlier_detection`, since
/// locality failover depends on it.
pub fn apply_load_balancer(
    cluster: &mut Cluster,
    lb: Option<&LoadBalancer>,
    port: Option<&Port>,
    locality: &Locality,
    mesh: &MeshConfig,
    features: &Features,
) {
    if features.send_unhealthy_endpoints {
        cluster.common_lb_config.healthy_panic_threshold = Some(0.0);
    }

    let setting = locality::locality_lb_setting(
        mesh.locality_lb_setting.as_ref(),
        lb.and_then(|lb| lb.locality_lb_setting.as_ref()),
    );
    if setting.is_some() {
        cluster.common_lb_config.locality_weighted_lb_config = true;
    }
    apply_locality_lb_setting(cluster, locality, setting);

    if cluster.discovery_type == DiscoveryType::OriginalDst {
        cluster.lb_policy = LbPolicy::ClusterProvided;
        return;
    }

    if port.map(|p| p.protocol == Protocol::Redis).unwrap_or(false) {
        cluster.lb_policy = LbPolicy::Maglev;
        return;
    }

    let warmup = lb.and_then(|lb| lb.warmup_duration);
    match lb.and_then(|lb| lb.simple) {
        Some(SimpleLb::LeastConn | SimpleLb::LeastRequest) | None => {
            cluster.lb_policy = LbPolicy::LeastRequest;
            cluster.lb_config = warmup.map(|w| {
                LbConfig::LeastRequest(SlowStartConfig {
                    slow_start_window: Some(w),
                })
            });
        }
        Some(SimpleLb::Random) => {
            cluster.lb_policy = LbPolicy::Random;
        }
        Some(SimpleLb::RoundRobin) => {
            cluster.lb_policy = LbPolicy::RoundRobin;
            cluster.lb_config = warmup.map(|w| {
                LbConfig::RoundRobin(SlowStartConfig {
                    slow_start_window: Some(w),
                })
            });
        }
        Some(SimpleLb::Passthrough) => {
            cluster.lb_policy = LbPolicy::ClusterProvided;
            cluster.discovery_type = DiscoveryType::OriginalDst;
            cluster.load_assignment = None;
        }
    }

    apply_ring_hash_load_balancer(cluster, lb);
}

/// Consistent hashing selects maglev or a ring hash. When neither algorithm is
/// named, the deprecated minimum ring size applies.
pub fn apply_ring_hash_load_balancer(cluster: &mut Cluster, lb: Option<&LoadBalancer>) {
    let Some(hash) = lb.and_then(|lb| lb.consistent_hash.as_ref()) else {
        return;
    };

    match hash.algorithm {
        Some(HashAlgorithm::Maglev { table_size }) => {
            cluster.lb_policy = LbPolicy::Maglev;
            if table_size != 0 {
                cluster.lb_config = Some(LbConfig::Maglev { table_size });
            }
        }
        Some(HashAlgorithm::RingHash { minimum_ring_size }) => {
            cluster.lb_policy = LbPolicy::RingHash;
            if minimum_ring_size != 0 {
                cluster.lb_config = Some(LbConfig::RingHash { minimum_ring_size });
            }
        }
        None => {
            let minimum_ring_size = if hash.minimum_ring_size != 0 {
                hash.minimum_ring_size
            } else {
                DEFAULT_MINIMUM_RING_SIZE
            };
            cluster.lb_policy = LbPolicy::RingHash;
            cluster.lb_config = Some(LbConfig::RingHash { minimum_ring_size });
        }
    }
}

/// Applies locality weighting or failover to the cluster's endpoint groups.
/// Clusters resolved by strict DNS are left alone, as are clusters without an
/// explicit assignment.
pub fn apply_locality_lb_setting(
    cluster: &mut Cluster,
    locality: &Locality,
    setting: Option<&LocalityLbSetting>,
) {
    let Some(setting) = setting else {
        return;
    };
    if cluster.discovery_type == DiscoveryType::StrictDns {
        return;
    }
    let enable_failover = cluster.outlier_detection.is_some();
    if let Some(load_assignment) = cluster.load_assignment.as_mut() {
        locality::apply_locality_load_balancer(locality, load_assignment, setting, enable_failover);
    }
}
