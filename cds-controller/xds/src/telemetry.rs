//! Stat names and the `istio` metadata block consumed by telemetry filters.

use crate::resource::Cluster;
use mesh_cds_controller_core::{
    cluster_name::TrafficDirection,
    destination::TlsMode,
    service::{Registry, ServiceAttributes},
    ConfigMeta, Features, Port, Service, ServiceTarget,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;

pub const ISTIO_METADATA_KEY: &str = "istio";

/// Builds an alternate stat name from a pattern such as
/// `%SERVICE%.%SUBSET_NAME%_%SERVICE_PORT%`.
pub fn build_stat_prefix(
    pattern: &str,
    hostname: &str,
    subset: &str,
    port: &Port,
    target_port: u16,
    attributes: &ServiceAttributes,
) -> String {
    let (short_name, name) = match attributes.registry {
        Registry::Kubernetes => (
            format!("{}.{}", attributes.name, attributes.namespace),
            attributes.name.clone(),
        ),
        Registry::External => (hostname.to_string(), hostname.to_string()),
    };
    pattern
        .replace("%SERVICE%", &short_name)
        .replace("%SERVICE_NAME%", &name)
        .replace("%SERVICE_FQDN%", hostname)
        .replace("%SUBSET_NAME%", subset)
        .replace("%TARGET_PORT%", &target_port.to_string())
        .replace("%SERVICE_PORT%", &port.port.to_string())
        .replace("%SERVICE_PORT_NAME%", &port.name)
}

/// Lists the services a cluster serves. Outbound clusters serve one service;
/// inbound clusters serve every service exposing the cluster's port.
pub(crate) fn add_telemetry_metadata(
    cluster: &mut Cluster,
    features: &Features,
    port: &Port,
    service: Option<&Service>,
    direction: TrafficDirection,
    inbound_services: &[ServiceTarget],
) {
    if !features.enable_telemetry_label {
        return;
    }

    let services = match direction {
        TrafficDirection::Inbound => {
            let mut seen = BTreeSet::new();
            inbound_services
                .iter()
                .filter(|t| t.port.service_port.port == port.port)
                .filter(|t| seen.insert(t.service.hostname.clone()))
                .map(|t| service_metadata(&t.service))
                .collect::<Vec<_>>()
        }
        TrafficDirection::Outbound | TrafficDirection::InboundVip => match service {
            Some(service) => vec![service_metadata(service)],
            None => return,
        },
    };
    if services.is_empty() {
        return;
    }
    cluster
        .metadata
        .set(ISTIO_METADATA_KEY, "services", Value::Array(services));
}

fn service_metadata(service: &Service) -> Value {
    json!({
        "host": service.hostname,
        "name": service.attributes.name,
        "namespace": service.attributes.namespace,
    })
}

pub(crate) fn add_networking_metadata(cluster: &mut Cluster, service: Option<&Service>) {
    if service.map(|s| s.mesh_external).unwrap_or(false) {
        cluster.metadata.set(ISTIO_METADATA_KEY, "external", true);
    }
}

/// Records the destination rule a cluster was configured by.
pub(crate) fn add_config_metadata(cluster: &mut Cluster, meta: &ConfigMeta) {
    let path = format!(
        "/apis/networking.istio.io/v1alpha3/namespaces/{}/destination-rule/{}",
        meta.namespace, meta.name
    );
    cluster.metadata.set(ISTIO_METADATA_KEY, "config", path);
}

pub(crate) fn add_subset_metadata(cluster: &mut Cluster, subset: &str) {
    cluster.metadata.set(ISTIO_METADATA_KEY, "subset", subset);
}

/// Anything but mesh mTLS must not have its ALPN rewritten by the proxy.
pub(crate) fn add_alpn_override(cluster: &mut Cluster, mode: TlsMode) {
    if mode != TlsMode::IstioMutual {
        cluster.metadata.set(ISTIO_METADATA_KEY, "alpn_override", "false");
    }
}
