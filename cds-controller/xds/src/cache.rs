//! Memoizes encoded clusters across the proxies of one push generation.

use crate::resource::Resource;
use ahash::RandomState;
use dashmap::DashMap;
use mesh_cds_controller_core::{
    cluster_name::{build_subset_key, parse_subset_key},
    destination::DestinationPolicy,
    proxy::{IpMode, Locality, ProxyView},
    service::MutualTlsMode,
    ConfigMeta, NodeType, Port,
};
use parking_lot::RwLock;

/// Every input that determines a cluster's encoded bytes. Equal keys must
/// always produce identical clusters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    pub cluster_name: String,
    pub generation: String,
    pub hostname: String,
    pub namespace: String,
    pub service_revision: String,
    pub port: Port,
    pub destination_rule: Option<ConfigMeta>,
    pub node_type: NodeType,
    pub locality: Locality,
    pub cluster_id: String,
    pub ip_mode: IpMode,
    pub view: ProxyView,
    pub hbone: bool,
    pub service_accounts: Vec<String>,
    pub envoy_filter_keys: Vec<String>,
    pub mtls_mode: MutualTlsMode,
}

/// A concurrent, insert-if-absent cluster store.
///
/// Concurrent builders of the same key produce the same bytes, so the first
/// insert wins and later ones are dropped.
#[derive(Debug)]
pub struct ClusterCache {
    generation: RwLock<String>,
    clusters: DashMap<ClusterKey, Resource, RandomState>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

// === impl ClusterKey ===

impl ClusterKey {
    /// Returns the key of another cluster built from the same inputs.
    pub fn with_cluster_name(&self, cluster_name: String) -> Self {
        Self {
            cluster_name,
            ..self.clone()
        }
    }
}

// === impl ClusterCache ===

impl Default for ClusterCache {
    fn default() -> Self {
        Self {
            generation: RwLock::new(String::new()),
            clusters: DashMap::with_hasher(RandomState::new()),
        }
    }
}

impl ClusterCache {
    /// Discards every cached cluster when `version` starts a new generation.
    pub fn begin_generation(&self, version: &str) {
        if *self.generation.read() == version {
            return;
        }

        let mut generation = self.generation.write();
        if *generation != version {
            tracing::debug!(from = %generation.as_str(), to = %version, "Resetting cluster cache");
            *generation = version.to_string();
            self.clusters.clear();
        }
    }

    pub fn get(&self, key: &ClusterKey) -> Option<Resource> {
        self.clusters.get(key).map(|r| r.value().clone())
    }

    /// Inserts a cluster unless one is already cached for `key`. Clusters of
    /// a superseded generation are not stored.
    pub fn add(&self, key: ClusterKey, resource: Resource) {
        if *self.generation.read() != key.generation {
            tracing::trace!(cluster = %key.cluster_name, generation = %key.generation, "Not caching stale cluster");
            return;
        }
        self.clusters.entry(key).or_insert(resource);
    }

    /// Looks up the default cluster identified by `key` and every subset
    /// cluster of `policy`. The second value is true only if all of them
    /// were found.
    pub fn get_all_cached_subset_clusters(
        &self,
        key: &ClusterKey,
        policy: Option<&DestinationPolicy>,
    ) -> (Vec<Option<Resource>>, bool) {
        let subsets = policy.map(|p| p.subsets.as_slice()).unwrap_or_default();
        let mut cached = Vec::with_capacity(1 + subsets.len());
        cached.push(self.get(key));

        if let Some(parsed) = parse_subset_key(&key.cluster_name) {
            for subset in subsets {
                let name = build_subset_key(parsed.direction, &subset.name, parsed.hostname, parsed.port);
                cached.push(self.get(&key.with_cluster_name(name)));
            }
        }

        let all_found = cached.len() == 1 + subsets.len() && cached.iter().all(Option::is_some);
        (cached, all_found)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

// === impl CacheStats ===

impl CacheStats {
    pub fn merge(self, other: Self) -> Self {
        Self {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hits == 0 && self.misses == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mesh_cds_controller_core::destination::Subset;
    use std::sync::Arc;

    fn mk_key(generation: &str) -> ClusterKey {
        ClusterKey {
            cluster_name: "outbound|80||foo.ns-0.svc.cluster.local".to_string(),
            generation: generation.to_string(),
            hostname: "foo.ns-0.svc.cluster.local".to_string(),
            namespace: "ns-0".to_string(),
            service_revision: String::new(),
            port: Port {
                port: 80,
                ..Default::default()
            },
            destination_rule: None,
            node_type: NodeType::Sidecar,
            locality: Locality::default(),
            cluster_id: "cluster-0".to_string(),
            ip_mode: IpMode::Ipv4,
            view: ProxyView::all(),
            hbone: false,
            service_accounts: vec![],
            envoy_filter_keys: vec![],
            mtls_mode: MutualTlsMode::Permissive,
        }
    }

    fn mk_resource(name: &str, body: &'static str) -> Resource {
        Resource {
            name: name.to_string(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[test]
    fn first_insert_wins() {
        let cache = ClusterCache::default();
        cache.begin_generation("1");
        let key = mk_key("1");
        cache.add(key.clone(), mk_resource(&key.cluster_name, "a"));
        cache.add(key.clone(), mk_resource(&key.cluster_name, "b"));
        assert_eq!(cache.get(&key).unwrap().body, Bytes::from_static(b"a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn new_generation_clears() {
        let cache = ClusterCache::default();
        cache.begin_generation("1");
        let key = mk_key("1");
        cache.add(key.clone(), mk_resource(&key.cluster_name, "a"));

        cache.begin_generation("1");
        assert_eq!(cache.len(), 1);

        cache.begin_generation("2");
        assert!(cache.is_empty());

        // A straggler from the previous generation is not stored.
        cache.add(key.clone(), mk_resource(&key.cluster_name, "a"));
        assert!(cache.is_empty());
    }

    #[test]
    fn partial_subset_hits() {
        let cache = ClusterCache::default();
        cache.begin_generation("1");
        let key = mk_key("1");
        let policy = DestinationPolicy {
            host: key.hostname.clone(),
            subsets: vec![
                Subset {
                    name: "v1".to_string(),
                    ..Default::default()
                },
                Subset {
                    name: "v2".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        cache.add(key.clone(), mk_resource(&key.cluster_name, "default"));
        let v1 = key.with_cluster_name("outbound|80|v1|foo.ns-0.svc.cluster.local".to_string());
        cache.add(v1.clone(), mk_resource(&v1.cluster_name, "v1"));

        let (cached, all_found) = cache.get_all_cached_subset_clusters(&key, Some(&policy));
        assert!(!all_found);
        assert_eq!(
            cached.iter().map(Option::is_some).collect::<Vec<_>>(),
            vec![true, true, false]
        );

        let v2 = key.with_cluster_name("outbound|80|v2|foo.ns-0.svc.cluster.local".to_string());
        cache.add(v2.clone(), mk_resource(&v2.cluster_name, "v2"));
        let (cached, all_found) = cache.get_all_cached_subset_clusters(&key, Some(&policy));
        assert!(all_found);
        assert_eq!(cached.len(), 3);
    }

    #[test]
    fn concurrent_inserts() {
        let cache = Arc::new(ClusterCache::default());
        cache.begin_generation("1");

        std::thread::scope(|s| {
            for i in 0..8 {
                let cache = cache.clone();
                s.spawn(move || {
                    for port in 0..64u16 {
                        let mut key = mk_key("1");
                        key.port.port = port;
                        key.cluster_name = format!("outbound|{port}||foo.ns-0.svc.cluster.local");
                        let body = if i % 2 == 0 { "even" } else { "odd" };
                        cache.add(key.clone(), mk_resource(&key.cluster_name, body));
                        assert!(cache.get(&key).is_some());
                    }
                });
            }
        });
        assert_eq!(cache.len(), 64);
    }
}
