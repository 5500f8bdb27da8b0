use crate::{
    endpoints::{self, build_locality_lb_endpoints},
    policy,
    resource::{
        Address, BindConfig, Cluster, ClusterLoadAssignment, DiscoveryType, DnsLookupFamily,
        EdsClusterConfig, Http2ProtocolOptions, InternalUpstreamTransport, LbConfig, LbEndpoint,
        LbPolicy, LocalityLbEndpoints, Metadata, MetadataKind, MetadataValueSource, Resource,
        TransportSocket, UpstreamTlsContext, ValidationContext,
    },
    telemetry,
    tls::{self, UpstreamTlsOpts, SDS_DEFAULT_RESOURCE, SDS_ROOT_RESOURCE},
};
use ahash::AHashSet as HashSet;
use mesh_cds_controller_core::{
    cluster_name::{build_dns_srv_subset_key, build_inbound_subset_key, build_subset_key, TrafficDirection},
    destination::{merge_traffic_policy, SimpleLb, Subset, TlsMode, TrafficPolicy},
    proxy::{IpMode, ProxyView},
    service::{MutualTlsMode, Registry},
    Config, Error, Features, NodeType, Port, Proxy, PushContext, Resolution, Service,
    ServiceTarget,
};

pub const BLACK_HOLE_CLUSTER: &str = "BlackHoleCluster";
pub const PASSTHROUGH_CLUSTER: &str = "PassthroughCluster";
pub const INBOUND_PASSTHROUGH_CLUSTER_IPV4: &str = "InboundPassthroughClusterIpv4";
pub const INBOUND_PASSTHROUGH_CLUSTER_IPV6: &str = "InboundPassthroughClusterIpv6";

/// Originates HBONE tunnels to the original destination's tunnel port.
pub const CONNECT_ORIGINATE: &str = "connect_originate";

/// The internal listener that terminates tunneled traffic.
pub const MAIN_INTERNAL: &str = "main_internal";

/// Sends waypoint traffic through the internal `connect_originate` listener.
pub const ENCAP: &str = "encap";

pub const SDS_EXTERNAL_CLUSTER: &str = "sds-external";
pub const CREDENTIAL_SOCKET_PATH: &str = "./var/run/secrets/credential-uds/socket";

pub const HBONE_INBOUND_PORT: u16 = 15008;

/// Traffic sent from these addresses is not redirected back to the proxy.
pub const INBOUND_PASSTHROUGH_BIND_IPV4: &str = "127.0.0.6";
pub const INBOUND_PASSTHROUGH_BIND_IPV6: &str = "::6";

pub(crate) const LOCALHOST_IPV4: &str = "127.0.0.1";
pub(crate) const LOCALHOST_IPV6: &str = "::1";

/// How a cluster's upstream transport is configured.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClusterMode {
    /// Ordinary outbound clusters with (auto) mTLS.
    Default,

    /// Clusters that forward SNI-routed traffic as-is, without TLS.
    SniDnat,

    /// Waypoint VIP clusters, whose traffic leaves through an internal
    /// listener.
    Waypoint,
}

/// The inputs of one cluster's traffic policy. Each construction step derives
/// a new value rather than modifying a shared one.
#[derive(Clone, Debug)]
pub struct BuildClusterOpts<'a> {
    /// The destination policy merged for the cluster's port (and subset).
    pub policy: Option<TrafficPolicy>,
    pub port: &'a Port,
    pub service_accounts: &'a [String],
    pub istio_mtls_sni: String,
    pub mode: ClusterMode,
    pub direction: TrafficDirection,
    pub mesh_external: bool,
    pub service_mtls_mode: MutualTlsMode,
}

/// Builds the clusters of one proxy against one push.
#[derive(Debug)]
pub struct ClusterBuilder<'a> {
    pub(crate) proxy: &'a Proxy,
    pub(crate) push: &'a PushContext,
    pub(crate) features: &'a Features,
    pub(crate) ip_mode: IpMode,
    passthrough_bind_ips: Vec<&'static str>,
}

// === impl ClusterBuilder ===

impl<'a> ClusterBuilder<'a> {
    pub fn new(proxy: &'a Proxy, push: &'a PushContext, features: &'a Features) -> Self {
        let ip_mode = proxy.ip_mode();
        let passthrough_bind_ips = match ip_mode {
            IpMode::Ipv4 => vec![INBOUND_PASSTHROUGH_BIND_IPV4],
            IpMode::Ipv6 => vec![INBOUND_PASSTHROUGH_BIND_IPV6],
            IpMode::Dual => vec![INBOUND_PASSTHROUGH_BIND_IPV4, INBOUND_PASSTHROUGH_BIND_IPV6],
        };
        Self {
            proxy,
            push,
            features,
            ip_mode,
            passthrough_bind_ips,
        }
    }

    pub(crate) fn view(&self) -> &'a ProxyView {
        &self.proxy.view
    }

    /// The loopback addresses a workload may listen on, in preference order.
    pub(crate) fn local_hosts(&self) -> &'static [&'static str] {
        match self.ip_mode {
            IpMode::Ipv4 => &[LOCALHOST_IPV4],
            IpMode::Ipv6 => &[LOCALHOST_IPV6],
            IpMode::Dual => &[LOCALHOST_IPV4, LOCALHOST_IPV6],
        }
    }

    /// Picks the discovery type for a service's resolution. Gateways cannot
    /// use original-destination clusters.
    pub fn discovery_type(&self, service: &Service) -> DiscoveryType {
        match service.resolution {
            Resolution::ClientSideLb => DiscoveryType::Eds,
            Resolution::DnsLb => DiscoveryType::StrictDns,
            Resolution::DnsRoundRobinLb => DiscoveryType::LogicalDns,
            Resolution::Passthrough => {
                if self.proxy.node_type == NodeType::Router {
                    return DiscoveryType::Eds;
                }
                if service.attributes.registry == Registry::Kubernetes
                    && self.features.enable_eds_for_headless
                {
                    return DiscoveryType::Eds;
                }
                DiscoveryType::OriginalDst
            }
        }
    }

    /// Builds a cluster with default settings. Returns `None` when a DNS or
    /// static cluster has no endpoints to assign.
    #[allow(clippy::too_many_arguments)]
    pub fn build_default_cluster(
        &self,
        name: String,
        discovery_type: DiscoveryType,
        endpoints: Vec<LocalityLbEndpoints>,
        direction: TrafficDirection,
        port: &Port,
        service: Option<&Service>,
        inbound_services: &[ServiceTarget],
    ) -> Option<Cluster> {
        let mut cluster = Cluster {
            name,
            discovery_type,
            ..Default::default()
        };

        match discovery_type {
            DiscoveryType::StrictDns | DiscoveryType::LogicalDns | DiscoveryType::Static => {
                if discovery_type != DiscoveryType::Static {
                    cluster.dns_lookup_family = Some(match self.ip_mode {
                        IpMode::Ipv4 => DnsLookupFamily::V4Only,
                        IpMode::Ipv6 => DnsLookupFamily::V6Only,
                        IpMode::Dual => DnsLookupFamily::All,
                    });
                    cluster.dns_refresh_rate = Some(self.push.mesh.dns_refresh_rate);
                    cluster.respect_dns_ttl = true;
                }
                if endpoints.is_empty() {
                    tracing::debug!(cluster = %cluster.name, "No endpoints for cluster");
                    return None;
                }
                cluster.load_assignment = Some(ClusterLoadAssignment {
                    cluster_name: cluster.name.clone(),
                    endpoints,
                });
            }
            DiscoveryType::OriginalDst => {
                cluster.lb_policy = LbPolicy::ClusterProvided;
            }
            DiscoveryType::Eds => {}
        }

        set_upstream_protocol(&mut cluster, port);
        policy::apply_connection_pool(&mut cluster, &self.push.mesh, self.features, None);
        telemetry::add_telemetry_metadata(
            &mut cluster,
            self.features,
            port,
            service,
            direction,
            inbound_services,
        );
        if direction != TrafficDirection::Inbound {
            telemetry::add_networking_metadata(&mut cluster, service);
        }
        Some(cluster)
    }

    /// Applies the destination policy for `port` to a default cluster and
    /// builds one cluster per policy subset.
    ///
    /// Only subsets whose cluster name satisfies `rebuild` are built, so that
    /// clusters already held in a cache need not be rebuilt. Subsets are
    /// returned in the policy's order.
    #[allow(clippy::too_many_arguments)]
    pub fn apply_destination_rule(
        &self,
        cluster: &mut Cluster,
        mode: ClusterMode,
        service: &Service,
        port: &Port,
        view: &ProxyView,
        dest_rule: Option<&Config>,
        service_accounts: &[String],
        rebuild: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<Cluster>, Error> {
        let rule = dest_rule.map(Config::destination_rule).transpose()?;
        let direction = match mode {
            ClusterMode::Waypoint => TrafficDirection::InboundVip,
            ClusterMode::Default | ClusterMode::SniDnat => TrafficDirection::Outbound,
        };

        let mut opts = BuildClusterOpts {
            policy: merge_traffic_policy(
                rule.and_then(|r| r.traffic_policy.as_ref()),
                None,
                Some(port),
            ),
            port,
            service_accounts: &[],
            istio_mtls_sni: String::new(),
            mode,
            direction,
            mesh_external: false,
            service_mtls_mode: MutualTlsMode::Unknown,
        };
        if mode == ClusterMode::Default {
            opts = BuildClusterOpts {
                service_accounts,
                istio_mtls_sni: build_dns_srv_subset_key(
                    TrafficDirection::Outbound,
                    "",
                    &service.hostname,
                    port.port,
                ),
                mesh_external: service.mesh_external,
                service_mtls_mode: self.push.best_effort_infer_service_mtls_mode(service),
                ..opts
            };
        }

        self.apply_traffic_policy(cluster, &opts);
        maybe_apply_eds_config(cluster);

        let (Some(config), Some(rule)) = (dest_rule, rule) else {
            return Ok(Vec::new());
        };
        telemetry::add_config_metadata(cluster, &config.meta);
        telemetry::add_alpn_override(cluster, tls_mode(&opts));

        let mut subsets = Vec::with_capacity(rule.subsets.len());
        for subset in &rule.subsets {
            let name = self.subset_cluster_name(mode, subset, service, port);
            if !rebuild(&name) {
                continue;
            }
            if let Some(c) =
                self.build_subset_cluster(name, &opts, cluster.discovery_type, config, subset, service, view)
            {
                subsets.push(c);
            }
        }
        Ok(subsets)
    }

    pub(crate) fn subset_cluster_name(
        &self,
        mode: ClusterMode,
        subset: &Subset,
        service: &Service,
        port: &Port,
    ) -> String {
        match mode {
            ClusterMode::Default => build_subset_key(
                TrafficDirection::Outbound,
                &subset.name,
                &service.hostname,
                port.port,
            ),
            ClusterMode::SniDnat => build_dns_srv_subset_key(
                TrafficDirection::Outbound,
                &subset.name,
                &service.hostname,
                port.port,
            ),
            ClusterMode::Waypoint => build_subset_key(
                TrafficDirection::InboundVip,
                &format!("{}/{}", vip_protocol(port), subset.name),
                &service.hostname,
                port.port,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_subset_cluster(
        &self,
        name: String,
        opts: &BuildClusterOpts<'_>,
        discovery_type: DiscoveryType,
        config: &Config,
        subset: &Subset,
        service: &Service,
        view: &ProxyView,
    ) -> Option<Cluster> {
        let port = opts.port;
        let passthrough = subset
            .traffic_policy
            .as_ref()
            .and_then(|p| p.load_balancer.as_ref())
            .and_then(|lb| lb.simple)
            == Some(SimpleLb::Passthrough);
        let discovery_type = if passthrough {
            DiscoveryType::OriginalDst
        } else {
            discovery_type
        };

        // Clusters that carry their own assignment only get the endpoints
        // selected by the subset's labels.
        let mut endpoints = Vec::new();
        if !passthrough && discovery_type != DiscoveryType::Eds {
            endpoints =
                build_locality_lb_endpoints(self.push, view, service, port.port, Some(&subset.labels));
            if endpoints.is_empty() {
                tracing::debug!(cluster = %name, "Locality endpoints missing for subset cluster");
            }
        }

        let mut cluster = self.build_default_cluster(
            name,
            discovery_type,
            endpoints,
            opts.direction,
            port,
            Some(service),
            &[],
        )?;
        let mesh = &self.push.mesh;
        if opts.mode == ClusterMode::Default && !mesh.outbound_cluster_stat_name.is_empty() {
            cluster.alt_stat_name = Some(telemetry::build_stat_prefix(
                &mesh.outbound_cluster_stat_name,
                &service.hostname,
                &subset.name,
                port,
                0,
                &service.attributes,
            ));
        }

        let istio_mtls_sni = match opts.mode {
            ClusterMode::Default => build_dns_srv_subset_key(
                TrafficDirection::Outbound,
                &subset.name,
                &service.hostname,
                port.port,
            ),
            ClusterMode::SniDnat | ClusterMode::Waypoint => String::new(),
        };
        let opts = BuildClusterOpts {
            policy: merge_traffic_policy(opts.policy.as_ref(), subset.traffic_policy.as_ref(), Some(port)),
            istio_mtls_sni,
            ..opts.clone()
        };
        self.apply_traffic_policy(&mut cluster, &opts);
        maybe_apply_eds_config(&mut cluster);

        telemetry::add_config_metadata(&mut cluster, &config.meta);
        telemetry::add_subset_metadata(&mut cluster, &subset.name);
        telemetry::add_alpn_override(&mut cluster, tls_mode(&opts));
        Some(cluster)
    }

    /// Applies the connection pool and, for clusters that are not inbound,
    /// ejection, load balancing and the upstream transport.
    pub fn apply_traffic_policy(&self, cluster: &mut Cluster, opts: &BuildClusterOpts<'_>) {
        let mesh = &self.push.mesh;
        let policy = opts.policy.as_ref();
        policy::apply_connection_pool(
            cluster,
            mesh,
            self.features,
            policy.and_then(|p| p.connection_pool.as_ref()),
        );

        if opts.direction != TrafficDirection::Inbound {
            policy::apply_outlier_detection(
                cluster,
                policy.and_then(|p| p.outlier_detection.as_ref()),
                self.features,
            );
            policy::apply_load_balancer(
                cluster,
                policy.and_then(|p| p.load_balancer.as_ref()),
                Some(opts.port),
                &self.proxy.locality,
                mesh,
                self.features,
            );

            match opts.mode {
                ClusterMode::Default => {
                    let (tls, ctx) = tls::upstream_tls_settings(
                        policy.and_then(|p| p.tls.as_ref()),
                        &UpstreamTlsOpts {
                            service_accounts: opts.service_accounts,
                            sni: &opts.istio_mtls_sni,
                            auto_mtls: mesh.enable_auto_mtls,
                            mesh_external: opts.mesh_external,
                            mtls_mode: opts.service_mtls_mode,
                        },
                    );
                    tls::apply_upstream_tls(cluster, tls.as_deref(), ctx, self.features);
                }
                ClusterMode::Waypoint => {
                    cluster.transport_socket = Some(internal_upstream_socket());
                }
                ClusterMode::SniDnat => {}
            }
        }

        if cluster.discovery_type == DiscoveryType::OriginalDst {
            cluster.lb_policy = LbPolicy::ClusterProvided;
        }
    }

    /// Builds the inbound cluster for a workload port. `bind` is the address
    /// the workload listens on: a unix socket, an IP, or empty to forward to
    /// the original destination.
    pub fn build_inbound_cluster_for_port_or_uds(
        &self,
        cluster_port: u16,
        bind: &str,
        target: &ServiceTarget,
        inbound_services: &[ServiceTarget],
    ) -> Result<Option<Cluster>, Error> {
        let port = &target.port.service_port;
        let endpoints = endpoints::build_inbound_locality_lb_endpoints(bind, target.port.target_port);
        let discovery_type = if endpoints.is_empty() {
            DiscoveryType::OriginalDst
        } else {
            DiscoveryType::Static
        };
        let Some(mut cluster) = self.build_default_cluster(
            build_inbound_subset_key(cluster_port),
            discovery_type,
            endpoints,
            TrafficDirection::Inbound,
            port,
            Some(&target.service),
            inbound_services,
        ) else {
            return Ok(None);
        };

        let mesh = &self.push.mesh;
        if !mesh.inbound_cluster_stat_name.is_empty() {
            cluster.alt_stat_name = Some(telemetry::build_stat_prefix(
                &mesh.inbound_cluster_stat_name,
                &target.service.hostname,
                "",
                port,
                target.port.target_port,
                &target.service.attributes,
            ));
        }

        // Circuit breakers configured for clients also bound what the server
        // side accepts.
        let scope = &self.proxy.sidecar_scope;
        let mut policy = None;
        if let Some(config) = scope.destination_rule(&target.service.hostname)? {
            if let Some(tp) = config.destination_rule()?.traffic_policy.as_ref() {
                policy = merge_traffic_policy(Some(tp), None, Some(port));
                telemetry::add_config_metadata(&mut cluster, &config.meta);
            }
        }
        if let Some(pool) = scope.inbound_connection_pool(cluster_port) {
            policy.get_or_insert_with(TrafficPolicy::default).connection_pool = Some(pool.clone());
        }

        let opts = BuildClusterOpts {
            policy,
            port,
            service_accounts: &[],
            istio_mtls_sni: String::new(),
            mode: ClusterMode::Default,
            direction: TrafficDirection::Inbound,
            mesh_external: false,
            service_mtls_mode: MutualTlsMode::Unknown,
        };
        self.apply_traffic_policy(&mut cluster, &opts);

        if !endpoints::is_unix_address(bind) && bind != LOCALHOST_IPV4 && bind != LOCALHOST_IPV6 {
            cluster.upstream_bind_config = Some(BindConfig {
                source_address: self.passthrough_bind_ips[0].to_string(),
                port: 0,
            });
        }
        Ok(Some(cluster))
    }

    /// A cluster with no endpoints, for traffic that must be dropped.
    pub fn build_black_hole_cluster(&self) -> Cluster {
        Cluster {
            name: BLACK_HOLE_CLUSTER.to_string(),
            discovery_type: DiscoveryType::Static,
            connect_timeout: Some(self.push.mesh.connect_timeout),
            lb_policy: LbPolicy::RoundRobin,
            ..Default::default()
        }
    }

    /// Forwards traffic that matched no other cluster to its original
    /// destination.
    pub fn build_default_passthrough_cluster(&self) -> Cluster {
        let mut cluster = Cluster {
            name: PASSTHROUGH_CLUSTER.to_string(),
            alt_stat_name: Some(format!("{PASSTHROUGH_CLUSTER};")),
            discovery_type: DiscoveryType::OriginalDst,
            lb_policy: LbPolicy::ClusterProvided,
            ..Default::default()
        };
        policy::apply_connection_pool(&mut cluster, &self.push.mesh, self.features, None);
        cluster
    }

    /// One passthrough cluster per IP family the proxy supports, bound to an
    /// address that is exempt from redirection.
    pub fn build_inbound_passthrough_clusters(&self) -> Vec<Cluster> {
        let mut families = Vec::with_capacity(2);
        if matches!(self.ip_mode, IpMode::Ipv4 | IpMode::Dual) {
            families.push((INBOUND_PASSTHROUGH_CLUSTER_IPV4, INBOUND_PASSTHROUGH_BIND_IPV4));
        }
        if matches!(self.ip_mode, IpMode::Ipv6 | IpMode::Dual) {
            families.push((INBOUND_PASSTHROUGH_CLUSTER_IPV6, INBOUND_PASSTHROUGH_BIND_IPV6));
        }

        families
            .into_iter()
            .map(|(name, bind)| {
                let mut cluster = self.build_default_passthrough_cluster();
                cluster.name = name.to_string();
                cluster.alt_stat_name = Some(format!("{name};"));
                cluster.upstream_bind_config = Some(BindConfig {
                    source_address: bind.to_string(),
                    port: 0,
                });
                cluster
            })
            .collect()
    }

    /// Tunnels traffic over HTTP/2 CONNECT to the destination's HBONE port
    /// using the workload certificate.
    pub fn build_connect_originate(&self) -> Cluster {
        Cluster {
            name: CONNECT_ORIGINATE.to_string(),
            discovery_type: DiscoveryType::OriginalDst,
            lb_policy: LbPolicy::ClusterProvided,
            lb_config: Some(LbConfig::OriginalDst {
                upstream_port_override: HBONE_INBOUND_PORT,
            }),
            connect_timeout: Some(self.push.mesh.connect_timeout),
            http2_protocol_options: Some(Http2ProtocolOptions::default()),
            transport_socket: Some(TransportSocket::Tls(UpstreamTlsContext {
                alpn_protocols: vec!["h2".to_string()],
                tls_certificate_sds_secret_configs: vec![SDS_DEFAULT_RESOURCE.to_string()],
                validation_context: Some(ValidationContext {
                    sds_secret_config: Some(SDS_ROOT_RESOURCE.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    /// Delivers tunneled connections to the internal listener that
    /// terminates them.
    pub fn build_main_internal_cluster(&self) -> Cluster {
        internal_cluster(MAIN_INTERNAL, MAIN_INTERNAL, self.push.mesh.connect_timeout)
    }

    /// Sends waypoint traffic to the internal listener that wraps it in a
    /// tunnel.
    pub fn build_encap_cluster(&self) -> Cluster {
        internal_cluster(ENCAP, CONNECT_ORIGINATE, self.push.mesh.connect_timeout)
    }

    /// Fetches credentials from the SDS server listening on `path`.
    pub fn build_external_sds_cluster(&self, path: &str) -> Cluster {
        Cluster {
            name: SDS_EXTERNAL_CLUSTER.to_string(),
            discovery_type: DiscoveryType::Static,
            connect_timeout: Some(self.push.mesh.connect_timeout),
            http2_protocol_options: Some(Http2ProtocolOptions::default()),
            load_assignment: Some(ClusterLoadAssignment {
                cluster_name: SDS_EXTERNAL_CLUSTER.to_string(),
                endpoints: vec![LocalityLbEndpoints {
                    lb_endpoints: vec![LbEndpoint {
                        address: Address::Pipe {
                            path: path.to_string(),
                        },
                        load_balancing_weight: None,
                        metadata: Metadata::default(),
                    }],
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }
    }

    /// Drops clusters whose name was already emitted. Conflicting service
    /// definitions may produce the same name; the first one wins.
    pub fn normalize_clusters(&self, resources: Vec<Resource>) -> Vec<Resource> {
        let mut seen = HashSet::with_capacity(resources.len());
        resources
            .into_iter()
            .filter(|r| {
                if seen.insert(r.name.clone()) {
                    return true;
                }
                tracing::warn!(proxy = %self.proxy.id, cluster = %r.name, "Duplicate cluster dropped");
                false
            })
            .collect()
    }
}

/// Enables HTTP/2 to upstreams that speak it.
pub(crate) fn set_upstream_protocol(cluster: &mut Cluster, port: &Port) {
    if port.protocol.is_http2() {
        cluster.http2_protocol_options = Some(Http2ProtocolOptions::default());
    }
}

/// Endpoint-discovered clusters fetch their endpoints by name over ADS. Must
/// run after load balancing is applied, since that may change the discovery
/// type.
pub(crate) fn maybe_apply_eds_config(cluster: &mut Cluster) {
    if cluster.discovery_type != DiscoveryType::Eds {
        return;
    }
    cluster.eds_cluster_config = Some(EdsClusterConfig {
        service_name: cluster.name.clone(),
        ads: true,
    });
}

fn tls_mode(opts: &BuildClusterOpts<'_>) -> TlsMode {
    opts.policy
        .as_ref()
        .and_then(|p| p.tls.as_ref())
        .map(|t| t.mode)
        .unwrap_or_default()
}

/// Waypoint VIP clusters are named for the protocol family they carry.
pub(crate) fn vip_protocol(port: &Port) -> &'static str {
    if port.protocol.is_http() {
        "http"
    } else {
        "tcp"
    }
}

/// Passes tunnel and telemetry metadata through an internal listener over a
/// plaintext socket.
pub(crate) fn internal_upstream_socket() -> TransportSocket {
    let source = |kind, name: &str| MetadataValueSource {
        kind,
        name: name.to_string(),
    };
    TransportSocket::InternalUpstream(InternalUpstreamTransport {
        passthrough_metadata: vec![
            source(MetadataKind::Host, "tunnel"),
            source(MetadataKind::Cluster, telemetry::ISTIO_METADATA_KEY),
            source(MetadataKind::Host, telemetry::ISTIO_METADATA_KEY),
        ],
        transport_socket: Box::new(TransportSocket::RawBuffer),
    })
}

fn internal_cluster(name: &str, listener: &str, connect_timeout: std::time::Duration) -> Cluster {
    Cluster {
        name: name.to_string(),
        discovery_type: DiscoveryType::Static,
        connect_timeout: Some(connect_timeout),
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: name.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    address: Address::EnvoyInternal {
                        server_listener_name: listener.to_string(),
                    },
                    load_balancing_weight: None,
                    metadata: Metadata::default(),
                }],
                ..Default::default()
            }],
        }),
        transport_socket: Some(internal_upstream_socket()),
        ..Default::default()
    }
}
