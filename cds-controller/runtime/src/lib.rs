#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_cds_controller_core as core;
pub use mesh_cds_controller_xds as xds;

mod args;
mod generate;
mod snapshot;

pub use self::{
    args::{Args, LogFormat},
    generate::{generate, ProxyClusters},
    snapshot::{DestinationRule, EndpointSpec, Model, ProxyModel, ProxySpec, SidecarSpec, Snapshot},
};
