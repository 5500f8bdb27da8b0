//! Applies operator-supplied cluster overrides to generated clusters.

use crate::resource::Cluster;
use mesh_cds_controller_core::{
    cluster_name::{parse_subset_key, TrafficDirection},
    patch::{ClusterMatch, ClusterPatch, PatchContext, PatchOperation, PatchRuleSet},
};
use serde_json::Value;

/// Applies the patches of one patch context. Without patches for the
/// context every operation passes clusters through untouched.
#[derive(Clone, Debug)]
pub struct ClusterPatcher<'a> {
    rules: Option<&'a PatchRuleSet>,
    context: PatchContext,
    has_patches: bool,
}

// === impl ClusterPatcher ===

impl<'a> ClusterPatcher<'a> {
    pub fn new(rules: Option<&'a PatchRuleSet>, context: PatchContext) -> Self {
        let has_patches = rules
            .map(|r| r.patches.iter().any(|p| p.context.applies_to(context)))
            .unwrap_or(false);
        Self {
            rules,
            context,
            has_patches,
        }
    }

    pub fn has_patches(&self) -> bool {
        self.has_patches
    }

    /// Identifies the filters whose patches may have altered a cluster.
    pub fn keys(&self) -> &'a [String] {
        self.rules.map(|r| r.keys.as_slice()).unwrap_or_default()
    }

    /// Returns the patched cluster, or `None` if a patch removes it. `hosts`
    /// names the services an inbound cluster serves, since inbound cluster
    /// names do not carry a hostname.
    pub fn patch(&self, hosts: &[&str], cluster: Cluster) -> Option<Cluster> {
        if !self.has_patches {
            return Some(cluster);
        }

        let patches = self.matching(hosts, &cluster);
        if patches.iter().any(|p| p.operation == PatchOperation::Remove) {
            tracing::debug!(cluster = %cluster.name, "Cluster removed by patch");
            return None;
        }

        let merges = patches
            .into_iter()
            .filter(|p| p.operation == PatchOperation::Merge)
            .collect::<Vec<_>>();
        if merges.is_empty() {
            return Some(cluster);
        }

        let mut value = match serde_json::to_value(&cluster) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, cluster = %cluster.name, "Failed to encode cluster for patching");
                return Some(cluster);
            }
        };
        for patch in merges {
            merge_json(&mut value, &patch.value);
        }
        match serde_json::from_value::<Cluster>(value) {
            Ok(patched) => Some(patched),
            Err(error) => {
                tracing::warn!(%error, cluster = %cluster.name, "Ignoring invalid cluster patch");
                Some(cluster)
            }
        }
    }

    /// Appends each cluster a patch does not remove.
    pub fn conditionally_append(
        &self,
        out: &mut Vec<Cluster>,
        hosts: &[&str],
        clusters: impl IntoIterator<Item = Cluster>,
    ) {
        if !self.has_patches {
            out.extend(clusters);
            return;
        }
        out.extend(clusters.into_iter().filter_map(|c| self.patch(hosts, c)));
    }

    /// Clusters added wholesale by patches.
    pub fn inserted_clusters(&self) -> Vec<Cluster> {
        let Some(rules) = self.rules.filter(|_| self.has_patches) else {
            return Vec::new();
        };
        rules
            .patches
            .iter()
            .filter(|p| p.operation == PatchOperation::Add && p.context.applies_to(self.context))
            .filter_map(|p| match serde_json::from_value::<Cluster>(p.value.clone()) {
                Ok(cluster) => Some(cluster),
                Err(error) => {
                    tracing::warn!(%error, "Ignoring invalid inserted cluster");
                    None
                }
            })
            .collect()
    }

    fn matching(&self, hosts: &[&str], cluster: &Cluster) -> Vec<&'a ClusterPatch> {
        let Some(rules) = self.rules else {
            return Vec::new();
        };
        rules
            .patches
            .iter()
            .filter(|p| p.context.applies_to(self.context))
            .filter(|p| cluster_matches(&p.cluster_match, cluster, hosts))
            .collect()
    }
}

fn cluster_matches(m: &ClusterMatch, cluster: &Cluster, hosts: &[&str]) -> bool {
    if let Some(name) = m.name.as_deref() {
        return name == cluster.name;
    }

    let (direction, subset, hostname, port) = match parse_subset_key(&cluster.name) {
        Some(key) => (Some(key.direction), key.subset, key.hostname, key.port),
        None => (None, "", "", 0),
    };
    if let Some(s) = m.subset.as_deref() {
        if s != subset {
            return false;
        }
    }
    if let Some(service) = m.service.as_deref() {
        let found = if direction == Some(TrafficDirection::Inbound) && !hosts.is_empty() {
            hosts.contains(&service)
        } else {
            hostname == service
        };
        if !found {
            return false;
        }
    }
    if let Some(p) = m.port.filter(|p| *p != 0) {
        if p != port {
            return false;
        }
    }
    true
}

/// Merges `patch` into `target`. Objects merge recursively, arrays are
/// appended and anything else is replaced.
fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (k, v) in patch {
                match target.get_mut(k) {
                    Some(existing) => merge_json(existing, v),
                    None => {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(patch)) => {
            target.extend(patch.iter().cloned());
        }
        (target, patch) => *target = patch.clone(),
    }
}
