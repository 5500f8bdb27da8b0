use crate::{
    builder::{ClusterBuilder, ClusterMode},
    endpoints::build_locality_lb_endpoints,
    patch::ClusterPatcher,
    resource::Cluster,
};
use mesh_cds_controller_core::{
    cluster_name::{build_dns_srv_subset_key, TrafficDirection},
    Error, Protocol,
};
use std::sync::Arc;

/// Builds clusters for gateways that route TLS traffic by SNI without
/// terminating it. Clusters carry no upstream TLS and are named in the SNI
/// form so the SNI can select them directly. These are never cached.
pub(crate) fn build_sni_dnat_clusters(
    cb: &ClusterBuilder<'_>,
    patcher: &ClusterPatcher<'_>,
) -> Result<Vec<Cluster>, Error> {
    let scope = &cb.proxy.sidecar_scope;
    let mut clusters = Vec::new();

    for service in scope.services.iter().filter(|s| !s.mesh_external) {
        let dest_rule = scope.destination_rule(&service.hostname)?;
        for port in &service.ports {
            if port.protocol == Protocol::Udp {
                continue;
            }
            let name = build_dns_srv_subset_key(TrafficDirection::Outbound, "", &service.hostname, port.port);
            let Some(mut cluster) = cb.build_default_cluster(
                name,
                cb.discovery_type(service),
                build_locality_lb_endpoints(cb.push, cb.view(), service, port.port, None),
                TrafficDirection::Outbound,
                port,
                Some(service),
                &[],
            ) else {
                continue;
            };

            let subsets = cb.apply_destination_rule(
                &mut cluster,
                ClusterMode::SniDnat,
                service,
                port,
                cb.view(),
                dest_rule.map(Arc::as_ref),
                &[],
                &|_: &str| true,
            )?;
            patcher.conditionally_append(&mut clusters, &[], std::iter::once(cluster).chain(subsets));
        }
    }
    Ok(clusters)
}
