#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Generates the cluster (CDS) resources of mesh proxies.

pub mod builder;
pub mod cache;
pub mod delta;
mod endpoints;
mod inbound;
pub mod locality;
mod outbound;
pub mod patch;
pub mod policy;
pub mod resource;
mod sni_dnat;
mod telemetry;
mod tls;
mod waypoint;

#[cfg(test)]
mod tests;

pub use self::{
    builder::{ClusterBuilder, ClusterMode},
    cache::{CacheStats, ClusterCache, ClusterKey},
    patch::ClusterPatcher,
    resource::{Cluster, Resource},
};

use ahash::AHashSet as HashSet;
use mesh_cds_controller_core::{
    patch::{PatchContext, PatchRuleSet},
    Error, Features, NodeType, Proxy, PushRequest, Service, WatchedResource,
};
use std::sync::Arc;

/// Generates clusters for proxies. Generators sharing a cache share the
/// clusters built for each push generation.
#[derive(Clone, Debug)]
pub struct ConfigGenerator {
    features: Features,
    cache: Arc<ClusterCache>,
}

/// The clusters generated for one proxy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterResponse {
    pub resources: Vec<Resource>,

    /// Names of clusters the proxy holds that no longer exist. Only set for
    /// delta pushes.
    pub removed: Vec<String>,

    /// Reports cache use, e.g. `cached:12/15`.
    pub log: Option<String>,

    /// True if only the clusters affected by the push were generated.
    pub delta: bool,
}

#[derive(Debug, Default)]
struct Generated {
    resources: Vec<Resource>,
    clusters: Vec<Cluster>,
    stats: CacheStats,
}

// === impl ConfigGenerator ===

impl ConfigGenerator {
    pub fn new(features: Features) -> Self {
        Self::with_cache(features, Arc::default())
    }

    pub fn with_cache(features: Features, cache: Arc<ClusterCache>) -> Self {
        Self { features, cache }
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn cache(&self) -> &Arc<ClusterCache> {
        &self.cache
    }

    /// Generates every cluster of `proxy`.
    pub fn build_clusters(&self, proxy: &Proxy, req: &PushRequest) -> Result<ClusterResponse, Error> {
        let services = if self.filters_gateway_services(proxy) {
            req.push.gateway_services(proxy)
        } else {
            proxy.sidecar_scope.services.clone()
        };
        let (resources, log) = self.build(proxy, req, &services)?;
        Ok(ClusterResponse {
            resources,
            removed: Vec::new(),
            log,
            delta: false,
        })
    }

    /// Generates only the clusters affected by the push's changes, along
    /// with the names of held clusters that were removed. Falls back to
    /// generating every cluster when the changes cannot be applied
    /// incrementally.
    pub fn build_delta_clusters(
        &self,
        proxy: &Proxy,
        req: &PushRequest,
        watched: &WatchedResource,
    ) -> Result<ClusterResponse, Error> {
        if !delta::should_use_delta(req) {
            return self.build_clusters(proxy, req);
        }

        let mut plan = delta::plan(proxy, req, watched)?;
        if self.filters_gateway_services(proxy) {
            let gateway = req
                .push
                .gateway_services(proxy)
                .into_iter()
                .map(|s| s.hostname.clone())
                .collect::<HashSet<_>>();
            plan.retain_services(watched, |s| gateway.contains(&s.hostname));
        }
        let (resources, log) = self.build(proxy, req, &plan.services)?;

        // A deleted cluster that was rebuilt still exists.
        let built = resources.iter().map(|r| r.name.as_str()).collect::<HashSet<_>>();
        let removed = plan
            .deleted
            .into_iter()
            .filter(|name| !built.contains(name.as_str()))
            .collect();
        Ok(ClusterResponse {
            resources,
            removed,
            log,
            delta: true,
        })
    }

    /// Routers may be limited to the services their gateways reference.
    fn filters_gateway_services(&self, proxy: &Proxy) -> bool {
        self.features.filter_gateway_cluster_config && proxy.node_type == NodeType::Router
    }

    fn build(
        &self,
        proxy: &Proxy,
        req: &PushRequest,
        services: &[Arc<Service>],
    ) -> Result<(Vec<Resource>, Option<String>), Error> {
        let push = &*req.push;
        let cache = if self.features.enable_cds_caching {
            self.cache.begin_generation(&push.version);
            Some(&*self.cache)
        } else {
            None
        };
        let rules = push.envoy_filters(proxy);
        let cb = ClusterBuilder::new(proxy, push, &self.features);

        let Generated {
            mut resources,
            mut clusters,
            stats,
        } = match proxy.node_type {
            NodeType::Sidecar => sidecar_clusters(&cb, cache, rules.as_ref(), services)?,
            NodeType::Waypoint => waypoint_clusters(&cb, cache, rules.as_ref(), services)?,
            NodeType::Router => gateway_clusters(&cb, cache, rules.as_ref(), services)?,
        };

        // Waypoints already carry the tunnel origination cluster.
        if proxy.enable_hbone && proxy.node_type != NodeType::Waypoint {
            clusters.push(cb.build_connect_originate());
        }
        if proxy.has_credential_socket() {
            clusters.push(cb.build_external_sds_cluster(builder::CREDENTIAL_SOCKET_PATH));
        }

        for cluster in clusters {
            match Resource::encode(&cluster) {
                Ok(r) => resources.push(r),
                Err(error) => {
                    tracing::warn!(%error, cluster = %cluster.name, "Failed to encode cluster");
                }
            }
        }
        let resources = cb.normalize_clusters(resources);

        let log = if stats.is_empty() {
            None
        } else {
            Some(format!("cached:{}/{}", stats.hits, stats.hits + stats.misses))
        };
        tracing::debug!(
            proxy = %proxy.id,
            role = ?proxy.node_type,
            clusters = resources.len(),
            log = log.as_deref().unwrap_or_default(),
            "Generated clusters",
        );
        Ok((resources, log))
    }
}

/// Sidecars get outbound clusters with catch-all clusters, then inbound
/// clusters with the inbound passthrough clusters.
fn sidecar_clusters(
    cb: &ClusterBuilder<'_>,
    cache: Option<&ClusterCache>,
    rules: Option<&PatchRuleSet>,
    services: &[Arc<Service>],
) -> Result<Generated, Error> {
    let outbound = ClusterPatcher::new(rules, PatchContext::SidecarOutbound);
    let (resources, stats) = outbound::build_outbound_clusters(cb, cache, &outbound, services)?;

    let mut clusters = Vec::new();
    outbound.conditionally_append(
        &mut clusters,
        &[],
        [cb.build_black_hole_cluster(), cb.build_default_passthrough_cluster()],
    );
    clusters.extend(outbound.inserted_clusters());

    let inbound = ClusterPatcher::new(rules, PatchContext::SidecarInbound);
    clusters.extend(inbound::build_inbound_clusters(cb, &inbound)?);
    if cb.proxy.enable_hbone {
        clusters.push(cb.build_main_internal_cluster());
    }
    inbound.conditionally_append(&mut clusters, &[], cb.build_inbound_passthrough_clusters());
    clusters.extend(inbound.inserted_clusters());

    Ok(Generated {
        resources,
        clusters,
        stats,
    })
}

/// Waypoints only need outbound clusters for hosts their services reach;
/// the services they serve are reached through VIP clusters.
fn waypoint_clusters(
    cb: &ClusterBuilder<'_>,
    cache: Option<&ClusterCache>,
    rules: Option<&PatchRuleSet>,
    services: &[Arc<Service>],
) -> Result<Generated, Error> {
    let served = cb.push.services_for_waypoint(cb.proxy);
    let outbound_services = waypoint::filter_waypoint_outbound_services(cb.push, &served, services);

    let outbound = ClusterPatcher::new(rules, PatchContext::SidecarOutbound);
    let (resources, stats) = outbound::build_outbound_clusters(cb, cache, &outbound, &outbound_services)?;

    let inbound = ClusterPatcher::new(rules, PatchContext::SidecarInbound);
    let mut clusters = waypoint::build_waypoint_inbound_clusters(cb, &served)?;
    clusters.extend(inbound.inserted_clusters());

    Ok(Generated {
        resources,
        clusters,
        stats,
    })
}

/// Gateways have no original-destination listeners, so they get no
/// passthrough cluster.
fn gateway_clusters(
    cb: &ClusterBuilder<'_>,
    cache: Option<&ClusterCache>,
    rules: Option<&PatchRuleSet>,
    services: &[Arc<Service>],
) -> Result<Generated, Error> {
    let patcher = ClusterPatcher::new(rules, PatchContext::Gateway);
    let (resources, stats) = outbound::build_outbound_clusters(cb, cache, &patcher, services)?;

    let mut clusters = Vec::new();
    patcher.conditionally_append(&mut clusters, &[], [cb.build_black_hole_cluster()]);
    let auto_passthrough = cb
        .proxy
        .merged_gateway
        .as_ref()
        .map(|g| g.contains_auto_passthrough_gateways)
        .unwrap_or(false);
    if auto_passthrough {
        clusters.extend(sni_dnat::build_sni_dnat_clusters(cb, &patcher)?);
    }
    clusters.extend(patcher.inserted_clusters());

    Ok(Generated {
        resources,
        clusters,
        stats,
    })
}
