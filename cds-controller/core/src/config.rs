use crate::{destination::DestinationPolicy, patch::EnvoyFilter, service::Service};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of mesh configuration that may trigger a push.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    ServiceEntry,
    DestinationRule,
    EnvoyFilter,
    VirtualService,
    Gateway,
    Sidecar,
    PeerAuthentication,
    WorkloadEntry,
}

/// Identifies a changed configuration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub kind: Kind,
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigMeta {
    pub name: String,
    pub namespace: String,

    /// Changes whenever the config's content changes.
    pub revision: String,
}

/// A typed mesh configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub meta: ConfigMeta,
    pub spec: ConfigSpec,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConfigSpec {
    DestinationRule(DestinationPolicy),
    ServiceEntry(Service),
    EnvoyFilter(EnvoyFilter),
}

/// Indicates that the mesh model does not hold what an index promised it
/// would. These are bugs, not bad user input.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config {namespace}/{name} is a {found}, not a {expected}")]
    UnexpectedKind {
        name: String,
        namespace: String,
        expected: Kind,
        found: Kind,
    },
}

// === impl Kind ===

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// === impl Config ===

impl Config {
    pub fn kind(&self) -> Kind {
        match self.spec {
            ConfigSpec::DestinationRule(_) => Kind::DestinationRule,
            ConfigSpec::ServiceEntry(_) => Kind::ServiceEntry,
            ConfigSpec::EnvoyFilter(_) => Kind::EnvoyFilter,
        }
    }

    pub fn key(&self) -> ConfigKey {
        ConfigKey {
            kind: self.kind(),
            name: self.meta.name.clone(),
            namespace: self.meta.namespace.clone(),
        }
    }

    /// Casts the config to a destination policy.
    pub fn destination_rule(&self) -> Result<&DestinationPolicy, Error> {
        match &self.spec {
            ConfigSpec::DestinationRule(dr) => Ok(dr),
            _ => Err(Error::UnexpectedKind {
                name: self.meta.name.clone(),
                namespace: self.meta.namespace.clone(),
                expected: Kind::DestinationRule,
                found: self.kind(),
            }),
        }
    }
}

// === impl ConfigKey ===

impl ConfigKey {
    pub fn new(kind: Kind, name: impl ToString, namespace: impl ToString) -> Self {
        Self {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}
