use crate::{
    builder::{ClusterBuilder, ClusterMode},
    cache::{CacheStats, ClusterCache, ClusterKey},
    endpoints::build_locality_lb_endpoints,
    patch::ClusterPatcher,
    resource::{Cluster, HealthStatus, Resource},
    telemetry,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use mesh_cds_controller_core::{
    cluster_name::{build_subset_key, TrafficDirection},
    Config, Error, Port, Protocol, Service,
};
use std::sync::Arc;

/// Endpoint health states that remain eligible for sticky sessions.
const PERSISTENT_SESSION_HOST_STATUS: [HealthStatus; 4] = [
    HealthStatus::Healthy,
    HealthStatus::Draining,
    HealthStatus::Unknown,
    HealthStatus::Degraded,
];

/// Builds the default and subset clusters of every non-UDP port of
/// `services`, reusing cached clusters when a cache is given.
pub(crate) fn build_outbound_clusters(
    cb: &ClusterBuilder<'_>,
    cache: Option<&ClusterCache>,
    patcher: &ClusterPatcher<'_>,
    services: &[Arc<Service>],
) -> Result<(Vec<Resource>, CacheStats), Error> {
    let mut resources = Vec::new();
    let mut stats = CacheStats::default();

    for service in services {
        let dest_rule = cb.proxy.sidecar_scope.destination_rule(&service.hostname)?;
        let policy = dest_rule.map(|c| c.destination_rule()).transpose()?;

        for port in &service.ports {
            if port.protocol == Protocol::Udp {
                continue;
            }
            let key = cluster_key(cb, service, port, dest_rule.map(Arc::as_ref), patcher.keys());

            let mut cached_names = HashSet::new();
            let mut cached = Vec::new();
            let mut verify = false;
            if let Some(cache) = cache {
                let (hits, all_found) = cache.get_all_cached_subset_clusters(&key, policy);
                if all_found && !cb.features.enable_unsafe_assertions {
                    stats.hits += hits.len();
                    resources.extend(hits.into_iter().flatten());
                    continue;
                }
                if all_found {
                    // Rebuild everything and compare below.
                    verify = true;
                    cached = hits.into_iter().flatten().collect();
                } else {
                    // The default cluster is always rebuilt, since subsets
                    // derive from it.
                    cached = hits.into_iter().skip(1).flatten().collect();
                    cached_names.extend(cached.iter().map(|r: &Resource| r.name.clone()));
                }
            }

            let Some(mut cluster) = cb.build_default_cluster(
                key.cluster_name.clone(),
                cb.discovery_type(service),
                build_locality_lb_endpoints(cb.push, cb.view(), service, port.port, None),
                TrafficDirection::Outbound,
                port,
                Some(service),
                &[],
            ) else {
                continue;
            };

            if service
                .attributes
                .labels
                .get(&cb.features.persistent_session_label)
                .map_or(false, |v| !v.is_empty())
            {
                cluster.common_lb_config.override_host_status = PERSISTENT_SESSION_HOST_STATUS.to_vec();
            }

            let mesh = &cb.push.mesh;
            if !mesh.outbound_cluster_stat_name.is_empty() {
                cluster.alt_stat_name = Some(telemetry::build_stat_prefix(
                    &mesh.outbound_cluster_stat_name,
                    &service.hostname,
                    "",
                    port,
                    0,
                    &service.attributes,
                ));
            }

            let subsets = cb.apply_destination_rule(
                &mut cluster,
                ClusterMode::Default,
                service,
                port,
                cb.view(),
                dest_rule.map(Arc::as_ref),
                &service.service_accounts,
                &|name: &str| !cached_names.contains(name),
            )?;

            let mut subsets = subsets
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect::<HashMap<_, _>>();
            let mut cached = cached
                .into_iter()
                .map(|r| (r.name.clone(), r))
                .collect::<HashMap<_, _>>();

            // Emit the default cluster followed by subsets in policy order,
            // whether rebuilt or cached.
            let mut built = Vec::with_capacity(1 + subsets.len());
            if let Some(r) = finish(patcher, cluster) {
                built.push((key.clone(), r));
            }
            let mut order = vec![key.cluster_name.clone()];
            for subset in policy.map(|p| p.subsets.as_slice()).unwrap_or_default() {
                let name = build_subset_key(
                    TrafficDirection::Outbound,
                    &subset.name,
                    &service.hostname,
                    port.port,
                );
                if let Some(c) = subsets.remove(&name) {
                    if let Some(r) = finish(patcher, c) {
                        built.push((key.with_cluster_name(name.clone()), r));
                    }
                }
                order.push(name);
            }

            if verify {
                assert_cache_consistent(&cached, &built);
            }

            let mut built = built
                .into_iter()
                .map(|(key, r)| (r.name.clone(), (key, r)))
                .collect::<HashMap<_, _>>();
            for name in order {
                let hit = if cached_names.contains(&name) {
                    cached.remove(&name)
                } else {
                    None
                };
                if let Some(r) = hit {
                    stats.hits += 1;
                    resources.push(r);
                } else if let Some((key, r)) = built.remove(&name) {
                    if let Some(cache) = cache {
                        stats.misses += 1;
                        cache.add(key, r.clone());
                    }
                    resources.push(r);
                }
            }
        }
    }

    Ok((resources, stats))
}

/// Patches and encodes a built cluster.
pub(crate) fn finish(patcher: &ClusterPatcher<'_>, cluster: Cluster) -> Option<Resource> {
    let cluster = patcher.patch(&[], cluster)?;
    match Resource::encode(&cluster) {
        Ok(r) => Some(r),
        Err(error) => {
            tracing::warn!(%error, cluster = %cluster.name, "Failed to encode cluster");
            None
        }
    }
}

fn cluster_key(
    cb: &ClusterBuilder<'_>,
    service: &Service,
    port: &Port,
    dest_rule: Option<&Config>,
    envoy_filter_keys: &[String],
) -> ClusterKey {
    let proxy = cb.proxy;
    ClusterKey {
        cluster_name: build_subset_key(TrafficDirection::Outbound, "", &service.hostname, port.port),
        generation: cb.push.version.clone(),
        hostname: service.hostname.clone(),
        namespace: service.attributes.namespace.clone(),
        service_revision: service.revision.clone(),
        port: port.clone(),
        destination_rule: dest_rule.map(|c| c.meta.clone()),
        node_type: proxy.node_type,
        locality: proxy.locality.clone(),
        cluster_id: proxy.cluster_id.clone(),
        ip_mode: cb.ip_mode,
        view: proxy.view.clone(),
        hbone: proxy.enable_hbone,
        service_accounts: service.service_accounts.clone(),
        envoy_filter_keys: envoy_filter_keys.to_vec(),
        mtls_mode: cb.push.best_effort_infer_service_mtls_mode(service),
    }
}

/// Panics if a cached cluster differs from the one just built from the same
/// key.
fn assert_cache_consistent(cached: &HashMap<String, Resource>, built: &[(ClusterKey, Resource)]) {
    for (_, r) in built {
        if let Some(c) = cached.get(&r.name) {
            if c.body != r.body {
                panic!(
                    "cached cluster {} differs from rebuilt cluster:\ncached: {}\nbuilt: {}",
                    r.name,
                    String::from_utf8_lossy(&c.body),
                    String::from_utf8_lossy(&r.body),
                );
            }
        }
    }
}
