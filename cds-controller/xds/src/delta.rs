//! Plans incremental cluster pushes.
//!
//! When only services and destination rules changed, just the clusters of
//! the affected services are rebuilt. Clusters the proxy holds that will not
//! be rebuilt are reported as removed.

use mesh_cds_controller_core::{
    cluster_name::parse_subset_key, ConfigKey, Error, Kind, Proxy, PushRequest, Service,
    WatchedResource,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// The config kinds whose changes can be pushed incrementally.
const DELTA_KINDS: [Kind; 2] = [Kind::ServiceEntry, Kind::DestinationRule];

/// The clusters a proxy holds, indexed by service hostname.
#[derive(Debug, Default)]
pub(crate) struct WatchedClusters {
    /// Default clusters, which have no subset.
    services: BTreeMap<String, BTreeSet<String>>,
    subsets: BTreeMap<String, BTreeSet<String>>,
    ports: BTreeMap<String, BTreeMap<u16, BTreeSet<String>>>,
}

/// The services to rebuild and the held clusters that may have been removed.
#[derive(Debug, Default)]
pub(crate) struct DeltaPlan {
    pub services: Vec<Arc<Service>>,
    pub deleted: BTreeSet<String>,
}

/// Returns true if every changed config may be pushed incrementally. A push
/// without changed configs is a full push.
pub fn should_use_delta(req: &PushRequest) -> bool {
    !req.configs_updated.is_empty()
        && req
            .configs_updated
            .iter()
            .all(|k| DELTA_KINDS.contains(&k.kind))
}

/// Computes the services affected by the push's changed configs and the
/// clusters they may no longer need.
pub(crate) fn plan(
    proxy: &Proxy,
    req: &PushRequest,
    watched: &WatchedResource,
) -> Result<DeltaPlan, Error> {
    let watched = WatchedClusters::new(watched);
    let mut plan = DeltaPlan::default();
    for key in &req.configs_updated {
        let (services, deleted) = match key.kind {
            Kind::ServiceEntry => delta_from_services(key, proxy, &watched),
            Kind::DestinationRule => delta_from_destination_rules(key, proxy, &watched)?,
            _ => continue,
        };
        for svc in services {
            let seen = plan.services.iter().any(|s| {
                s.hostname == svc.hostname && s.attributes.namespace == svc.attributes.namespace
            });
            if !seen {
                plan.services.push(svc);
            }
        }
        plan.deleted.extend(deleted);
    }
    tracing::debug!(
        proxy = %proxy.id,
        services = plan.services.len(),
        deleted = plan.deleted.len(),
        "Planned delta push",
    );
    Ok(plan)
}

/// A changed service is rebuilt if the proxy still sees it. Otherwise all of
/// its clusters are deleted. Clusters of ports the service no longer has are
/// deleted either way.
fn delta_from_services(
    key: &ConfigKey,
    proxy: &Proxy,
    watched: &WatchedClusters,
) -> (Vec<Arc<Service>>, Vec<String>) {
    let Some(service) = proxy.sidecar_scope.service_for_hostname(&key.name) else {
        let deleted = watched
            .services
            .get(&key.name)
            .into_iter()
            .chain(watched.subsets.get(&key.name))
            .flatten()
            .cloned()
            .collect();
        return (Vec::new(), deleted);
    };

    let deleted = watched
        .ports
        .get(&service.hostname)
        .into_iter()
        .flatten()
        .filter(|(port, _)| service.port(**port).is_none())
        .flat_map(|(_, names)| names.iter().cloned())
        .collect();
    (vec![service.clone()], deleted)
}

// === impl DeltaPlan ===

impl DeltaPlan {
    /// Keeps only the services the proxy generates clusters for. The held
    /// clusters of dropped services are deleted.
    pub(crate) fn retain_services(
        &mut self,
        watched: &WatchedResource,
        mut keep: impl FnMut(&Service) -> bool,
    ) {
        let mut dropped = Vec::new();
        self.services.retain(|svc| {
            let kept = keep(&**svc);
            if !kept {
                dropped.push(svc.hostname.clone());
            }
            kept
        });
        if dropped.is_empty() {
            return;
        }

        let watched = WatchedClusters::new(watched);
        for host in &dropped {
            self.deleted.extend(
                watched
                    .services
                    .get(host)
                    .into_iter()
                    .chain(watched.subsets.get(host))
                    .flatten()
                    .cloned(),
            );
        }
    }
}

/// Services selected by a changed destination rule are rebuilt, and their
/// held subset clusters are deleted unless the rebuild recreates them. If the
/// rule's host changed, services selected by the previous host are rebuilt
/// too.
fn delta_from_destination_rules(
    key: &ConfigKey,
    proxy: &Proxy,
    watched: &WatchedClusters,
) -> Result<(Vec<Arc<Service>>, Vec<String>), Error> {
    let scope = &proxy.sidecar_scope;
    let prev = proxy
        .prev_sidecar_scope
        .as_ref()
        .and_then(|s| s.destination_rule_by_name(&key.name, &key.namespace));

    let mut services = Vec::new();
    match scope.destination_rule_by_name(&key.name, &key.namespace) {
        Some(config) => {
            let host = &config.destination_rule()?.host;
            services.extend(scope.services_for_hostname(host));
            if let Some(prev) = prev {
                let prev_host = &prev.destination_rule()?.host;
                if prev_host != host {
                    services.extend(scope.services_for_hostname(prev_host));
                }
            }
        }
        None => {
            let Some(prev) = prev else {
                tracing::debug!(
                    name = %key.name,
                    namespace = %key.namespace,
                    "Previous destination rule is missing",
                );
                return Ok((Vec::new(), Vec::new()));
            };
            services.extend(scope.services_for_hostname(&prev.destination_rule()?.host));
        }
    }

    let deleted = services
        .iter()
        .filter_map(|s| watched.subsets.get(&s.hostname))
        .flatten()
        .cloned()
        .collect();
    Ok((services, deleted))
}

// === impl WatchedClusters ===

impl WatchedClusters {
    pub(crate) fn new(watched: &WatchedResource) -> Self {
        let mut clusters = Self::default();
        for name in &watched.resource_names {
            let Some(key) = parse_subset_key(name) else {
                continue;
            };
            let host = key.hostname.to_string();
            if key.subset.is_empty() {
                insert_or_new(&mut clusters.services, host.clone(), name.clone());
            } else {
                insert_or_new(&mut clusters.subsets, host.clone(), name.clone());
            }
            insert_or_new(clusters.ports.entry(host).or_default(), key.port, name.clone());
        }
        clusters
    }
}

/// Inserts `value` into the set at `key`, creating the set if needed.
fn insert_or_new<K: Ord, V: Ord>(map: &mut BTreeMap<K, BTreeSet<V>>, key: K, value: V) {
    map.entry(key).or_default().insert(value);
}
