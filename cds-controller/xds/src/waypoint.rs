use crate::{
    builder::{vip_protocol, ClusterBuilder, ClusterMode},
    endpoints::build_locality_lb_endpoints,
    resource::Cluster,
};
use ahash::AHashSet as HashSet;
use mesh_cds_controller_core::{
    cluster_name::{build_subset_key, TrafficDirection},
    Error, Protocol, PushContext, Service,
};
use std::sync::Arc;

/// Builds the clusters through which a waypoint reaches the services it
/// serves: the internal tunnel clusters, one VIP cluster per service port
/// (plus destination rule subsets) and the tunnel origination cluster.
pub(crate) fn build_waypoint_inbound_clusters(
    cb: &ClusterBuilder<'_>,
    served: &[Arc<Service>],
) -> Result<Vec<Cluster>, Error> {
    let scope = &cb.proxy.sidecar_scope;
    let mut clusters = vec![cb.build_main_internal_cluster(), cb.build_encap_cluster()];

    for service in served {
        let dest_rule = scope.destination_rule(&service.hostname)?;
        for port in &service.ports {
            if port.protocol == Protocol::Udp {
                continue;
            }
            let name = build_subset_key(
                TrafficDirection::InboundVip,
                vip_protocol(port),
                &service.hostname,
                port.port,
            );
            let Some(mut cluster) = cb.build_default_cluster(
                name,
                cb.discovery_type(service),
                build_locality_lb_endpoints(cb.push, cb.view(), service, port.port, None),
                TrafficDirection::InboundVip,
                port,
                Some(service),
                &[],
            ) else {
                continue;
            };

            let subsets = cb.apply_destination_rule(
                &mut cluster,
                ClusterMode::Waypoint,
                service,
                port,
                cb.view(),
                dest_rule.map(Arc::as_ref),
                &[],
                &|_: &str| true,
            )?;
            clusters.push(cluster);
            clusters.extend(subsets);
        }
    }

    clusters.push(cb.build_connect_originate());
    Ok(clusters)
}

/// Limits a waypoint's outbound clusters to the hosts its served services
/// send traffic to. A served service is only reached through its VIP
/// cluster, unless it is external to the mesh.
pub(crate) fn filter_waypoint_outbound_services(
    push: &PushContext,
    served: &[Arc<Service>],
    services: &[Arc<Service>],
) -> Vec<Arc<Service>> {
    let mut outbound = HashSet::new();
    for svc in served {
        let Some(refs) = push.service_references.get(&svc.hostname) else {
            continue;
        };
        for host in refs {
            let keep = served
                .iter()
                .find(|s| s.hostname == *host)
                .map(|s| s.mesh_external)
                .unwrap_or(true);
            if keep {
                outbound.insert(host.as_str());
            }
        }
    }

    services
        .iter()
        .filter(|s| outbound.contains(s.hostname.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, btreeset};
    use mesh_cds_controller_core::MeshConfig;

    fn mk_service(hostname: &str, mesh_external: bool) -> Arc<Service> {
        Arc::new(Service {
            hostname: hostname.to_string(),
            mesh_external,
            ..Default::default()
        })
    }

    #[test]
    fn outbound_services_are_referenced_and_not_served() {
        let a = mk_service("a.ns-0.svc.cluster.local", false);
        let b = mk_service("b.ns-0.svc.cluster.local", false);
        let ext = mk_service("api.example.com", true);
        let other = mk_service("c.ns-1.svc.cluster.local", false);
        let unreferenced = mk_service("d.ns-1.svc.cluster.local", false);

        let mut push = PushContext::new("1", MeshConfig::default());
        push.service_references = btreemap! {
            a.hostname.clone() => btreeset! {
                b.hostname.clone(),
                ext.hostname.clone(),
                other.hostname.clone(),
            },
        };

        let served = vec![a.clone(), b.clone(), ext.clone()];
        let all = vec![a, b, ext.clone(), other.clone(), unreferenced];
        let outbound = filter_waypoint_outbound_services(&push, &served, &all);
        assert_eq!(outbound, vec![ext, other]);
    }

    #[test]
    fn nothing_referenced() {
        let a = mk_service("a.ns-0.svc.cluster.local", false);
        let push = PushContext::new("1", MeshConfig::default());
        let outbound = filter_waypoint_outbound_services(&push, &[a.clone()], &[a]);
        assert!(outbound.is_empty());
    }
}
