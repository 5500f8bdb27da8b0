//! Cluster override rules supplied by operators.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where in a proxy's configuration a patch applies.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchContext {
    #[default]
    Any,
    SidecarInbound,
    SidecarOutbound,
    Gateway,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchOperation {
    Add,
    Remove,
    Merge,
}

/// Selects clusters by name or by the parts of a structured cluster name.
/// Unset fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterMatch {
    pub name: Option<String>,
    pub service: Option<String>,
    pub port: Option<u16>,
    pub subset: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterPatch {
    #[serde(default)]
    pub context: PatchContext,
    pub operation: PatchOperation,
    #[serde(default, rename = "match")]
    pub cluster_match: ClusterMatch,

    /// For `ADD` a whole cluster; for `MERGE` a fragment deep-merged into the
    /// matched cluster.
    #[serde(default)]
    pub value: serde_json::Value,
}

/// A named set of cluster patches that applies to the proxies it selects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvoyFilter {
    pub name: String,
    pub namespace: String,
    pub revision: String,

    /// Proxies whose labels include all of these are patched. Empty selects
    /// every proxy in scope.
    pub workload_selector: BTreeMap<String, String>,
    pub patches: Vec<ClusterPatch>,
}

/// The cluster patches that apply to one proxy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatchRuleSet {
    /// Identifies each contributing filter and its revision. Part of every
    /// cache key.
    pub keys: Vec<String>,
    pub patches: Vec<ClusterPatch>,
}

// === impl PatchContext ===

impl PatchContext {
    /// Returns true if a patch declared for `self` applies in `context`.
    pub fn applies_to(&self, context: PatchContext) -> bool {
        *self == Self::Any || *self == context
    }
}

// === impl EnvoyFilter ===

impl EnvoyFilter {
    pub fn key(&self) -> String {
        format!("{}/{}@{}", self.namespace, self.name, self.revision)
    }

    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        self.workload_selector
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

// === impl PatchRuleSet ===

impl PatchRuleSet {
    pub fn from_filters<'f>(filters: impl IntoIterator<Item = &'f EnvoyFilter>) -> Self {
        let mut rules = Self::default();
        for filter in filters {
            if filter.patches.is_empty() {
                continue;
            }
            rules.keys.push(filter.key());
            rules.patches.extend(filter.patches.iter().cloned());
        }
        rules
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}
