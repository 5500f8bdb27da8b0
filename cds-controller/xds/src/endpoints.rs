use crate::{
    resource::{Address, LbEndpoint, LocalityLbEndpoints, Metadata},
    tls::TLS_MODE_MATCH_KEY,
};
use mesh_cds_controller_core::{
    proxy::{Locality, ProxyView},
    service::{Resolution, Service},
    PushContext,
};
use std::collections::BTreeMap;

const TRANSPORT_SOCKET_MATCH_KEY: &str = "envoy.transport_socket_match";
const UNIX_PREFIX: &str = "unix://";

/// Builds the endpoint groups of a DNS-resolved cluster, grouped by locality.
/// Other resolutions discover endpoints at runtime and yield no groups.
pub(crate) fn build_locality_lb_endpoints(
    push: &PushContext,
    view: &ProxyView,
    service: &Service,
    port: u16,
    labels: Option<&BTreeMap<String, String>>,
) -> Vec<LocalityLbEndpoints> {
    if !matches!(
        service.resolution,
        Resolution::DnsLb | Resolution::DnsRoundRobinLb
    ) {
        return Vec::new();
    }

    let mut by_locality = BTreeMap::<&str, Vec<LbEndpoint>>::new();
    for instance in push.service_instances_by_port(service, port, labels) {
        let ep = &instance.endpoint;
        if !view.is_visible(&ep.network) {
            continue;
        }

        let mut metadata = Metadata::default();
        let tls_mode = if ep.tls_mode.is_empty() {
            "disabled"
        } else {
            ep.tls_mode.as_str()
        };
        metadata.set(TRANSPORT_SOCKET_MATCH_KEY, TLS_MODE_MATCH_KEY, tls_mode);

        by_locality
            .entry(ep.locality.as_str())
            .or_default()
            .push(LbEndpoint {
                address: Address::Socket {
                    address: ep.address.clone(),
                    port: ep.endpoint_port,
                },
                load_balancing_weight: Some(ep.weight.max(1)),
                metadata,
            });
    }

    by_locality
        .into_iter()
        .map(|(locality, lb_endpoints)| {
            let weight = lb_endpoints
                .iter()
                .map(|ep| u64::from(ep.load_balancing_weight.unwrap_or(1)))
                .sum::<u64>();
            let weight = u32::try_from(weight).unwrap_or(u32::MAX);
            LocalityLbEndpoints {
                locality: Some(Locality::parse(locality)),
                lb_endpoints,
                load_balancing_weight: Some(weight),
                priority: 0,
            }
        })
        .collect()
}

/// Inbound clusters forward to the bind address, or to the original
/// destination when there is none.
pub(crate) fn build_inbound_locality_lb_endpoints(bind: &str, port: u16) -> Vec<LocalityLbEndpoints> {
    if bind.is_empty() {
        return Vec::new();
    }
    let address = match bind.strip_prefix(UNIX_PREFIX) {
        Some(path) => Address::Pipe {
            path: path.to_string(),
        },
        None => Address::Socket {
            address: bind.to_string(),
            port,
        },
    };
    vec![LocalityLbEndpoints {
        locality: None,
        lb_endpoints: vec![LbEndpoint {
            address,
            load_balancing_weight: None,
            metadata: Metadata::default(),
        }],
        load_balancing_weight: None,
        priority: 0,
    }]
}

pub(crate) fn is_unix_address(bind: &str) -> bool {
    bind.starts_with(UNIX_PREFIX)
}
