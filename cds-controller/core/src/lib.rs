#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster_name;
pub mod config;
pub mod destination;
pub mod duration;
mod features;
pub mod mesh;
pub mod patch;
pub mod proxy;
pub mod push;
pub mod service;

pub use self::{
    config::{Config, ConfigKey, ConfigMeta, ConfigSpec, Error, Kind},
    features::Features,
    mesh::MeshConfig,
    proxy::{NodeType, Proxy},
    push::{PushContext, PushRequest, WatchedResource},
    service::{Port, Protocol, Resolution, Service, ServiceInstance, ServiceTarget},
};

/// The metadata key a proxy sets when it has a credential socket mounted.
pub const CREDENTIAL_META_DATA: &str = "CREDENTIAL_META_DATA";

/// The label a workload endpoint carries to advertise its TLS mode.
pub const TLS_MODE_LABEL: &str = "security.istio.io/tlsMode";

/// The TLS mode label value for endpoints that accept mesh mTLS.
pub const ISTIO_MUTUAL_TLS_MODE: &str = "istio";
