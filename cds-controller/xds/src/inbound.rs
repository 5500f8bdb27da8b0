use crate::{
    builder::{ClusterBuilder, LOCALHOST_IPV4, LOCALHOST_IPV6},
    endpoints::is_unix_address,
    patch::ClusterPatcher,
    resource::Cluster,
};
use ahash::AHashSet as HashSet;
use mesh_cds_controller_core::{
    proxy::{IngressListener, InterceptionMode},
    service::{ServiceAttributes, ServiceInstancePort},
    Error, Service, ServiceTarget,
};
use std::{collections::BTreeMap, net::IpAddr, sync::Arc};

/// A default endpoint host that resolves to the proxy's IPv4 address.
const POD_IPV4_PLACEHOLDER: &str = "0.0.0.0";

/// A default endpoint host that resolves to the proxy's IPv6 address.
const POD_IPV6_PLACEHOLDER: &str = "::";

/// Builds the clusters that deliver inbound traffic to the workload.
///
/// Without ingress listeners, one cluster is built per workload port the
/// proxy serves. Otherwise each listener gets a cluster, optionally alongside
/// the per-port clusters of ports no listener claims.
pub(crate) fn build_inbound_clusters(
    cb: &ClusterBuilder<'_>,
    patcher: &ClusterPatcher<'_>,
) -> Result<Vec<Cluster>, Error> {
    let proxy = cb.proxy;
    let scope = &proxy.sidecar_scope;
    let mut clusters = Vec::new();

    if !scope.has_ingress_listeners() {
        if proxy.interception_mode == InterceptionMode::None {
            tracing::debug!(proxy = %proxy.id, "Inbound traffic is not intercepted; no inbound clusters");
            return Ok(clusters);
        }
        build_service_target_clusters(cb, patcher, &HashSet::new(), &mut clusters)?;
        return Ok(clusters);
    }

    if cb.features.enable_sidecar_service_inbound_listener_merge {
        let claimed = scope.ingress.iter().map(|l| l.port.port).collect::<HashSet<_>>();
        build_service_target_clusters(cb, patcher, &claimed, &mut clusters)?;
    }

    for listener in &scope.ingress {
        let Some((bind, target_port)) = resolve_default_endpoint(cb, &listener.default_endpoint) else {
            tracing::debug!(
                port = listener.port.port,
                endpoint = %listener.default_endpoint,
                "Skipping ingress listener with an invalid default endpoint",
            );
            continue;
        };
        let target = ServiceTarget {
            service: find_or_create_service(cb, listener),
            port: ServiceInstancePort {
                service_port: listener.port.clone(),
                target_port,
            },
        };
        if let Some(cluster) =
            cb.build_inbound_cluster_for_port_or_uds(listener.port.port, &bind, &target, &[])?
        {
            patcher.conditionally_append(&mut clusters, &[target.service.hostname.as_str()], [cluster]);
        }
    }
    Ok(clusters)
}

/// Builds one cluster per workload port, skipping `claimed` ports. The first
/// service served on a port names the cluster.
fn build_service_target_clusters(
    cb: &ClusterBuilder<'_>,
    patcher: &ClusterPatcher<'_>,
    claimed: &HashSet<u16>,
    out: &mut Vec<Cluster>,
) -> Result<(), Error> {
    let mut by_port = BTreeMap::<u16, Vec<ServiceTarget>>::new();
    for target in cb.proxy.service_targets() {
        by_port.entry(target.port.target_port).or_default().push(target);
    }

    // With passthrough, traffic goes to the original destination rather than
    // a loopback address.
    let bind = if cb.features.enable_inbound_passthrough {
        ""
    } else {
        cb.local_hosts()[0]
    };

    for (port, targets) in by_port {
        if claimed.contains(&port) {
            continue;
        }
        let hosts = targets
            .iter()
            .map(|t| t.service.hostname.as_str())
            .collect::<Vec<_>>();
        if let Some(cluster) = cb.build_inbound_cluster_for_port_or_uds(port, bind, &targets[0], &targets)? {
            patcher.conditionally_append(out, &hosts, [cluster]);
        }
    }
    Ok(())
}

/// Resolves a listener's default endpoint to the address the cluster
/// forwards to and the workload port. An empty address forwards to the
/// original destination: that is the case for an empty endpoint and for any
/// host that is neither a pod placeholder nor loopback.
fn resolve_default_endpoint(cb: &ClusterBuilder<'_>, endpoint: &str) -> Option<(String, u16)> {
    if endpoint.is_empty() {
        return Some((String::new(), 0));
    }
    if is_unix_address(endpoint) {
        return Some((endpoint.to_string(), 0));
    }

    let (host, port) = split_host_port(endpoint)?;

    let proxy = cb.proxy;
    let local_hosts = cb.local_hosts();
    let local = |v4: bool| {
        local_hosts
            .iter()
            .find(|h| h.parse::<IpAddr>().map(|ip| ip.is_ipv4() == v4).unwrap_or(false))
            .copied()
    };
    let bind = match host {
        POD_IPV4_PLACEHOLDER => proxy
            .first_ipv4()
            .unwrap_or_else(|| LOCALHOST_IPV4.to_string()),
        POD_IPV6_PLACEHOLDER => proxy
            .first_ipv6()
            .unwrap_or_else(|| LOCALHOST_IPV6.to_string()),
        LOCALHOST_IPV4 => local(true).or_else(|| local(false)).unwrap_or(LOCALHOST_IPV4).to_string(),
        LOCALHOST_IPV6 => local(false).or_else(|| local(true)).unwrap_or(LOCALHOST_IPV6).to_string(),
        _ => String::new(),
    };
    Some((bind, port))
}

/// Splits `host:port`. Hosts containing colons must be bracketed.
fn split_host_port(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = match endpoint.strip_prefix('[') {
        Some(rest) => rest.split_once("]:")?,
        None => {
            let (host, port) = endpoint.rsplit_once(':')?;
            if host.contains(':') {
                return None;
            }
            (host, port)
        }
    };
    if host.contains(|c: char| c == '[' || c == ']') {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Returns the served service whose workload port matches the listener, or a
/// service named for the sidecar scope.
fn find_or_create_service(cb: &ClusterBuilder<'_>, listener: &IngressListener) -> Arc<Service> {
    let proxy = cb.proxy;
    if let Some(instance) = proxy
        .service_instances
        .iter()
        .find(|i| i.endpoint.endpoint_port == listener.port.port)
    {
        return instance.service.clone();
    }

    let scope = &proxy.sidecar_scope;
    Arc::new(Service {
        hostname: format!("{}.{}", scope.name, scope.namespace),
        attributes: ServiceAttributes {
            name: scope.name.clone(),
            namespace: scope.namespace.clone(),
            ..Default::default()
        },
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_cds_controller_core::{Features, MeshConfig, Proxy, PushContext};

    fn mk_proxy(ips: &[&str]) -> Proxy {
        Proxy {
            id: "sidecar~10.0.0.1~pod-0.ns-0".to_string(),
            ip_addresses: ips.iter().map(|ip| ip.to_string()).collect(),
            ..Default::default()
        }
    }

    fn resolve(ips: &[&str], endpoint: &str) -> Option<(String, u16)> {
        let proxy = mk_proxy(ips);
        let push = PushContext::new("1", MeshConfig::default());
        let features = Features::default();
        let cb = ClusterBuilder::new(&proxy, &push, &features);
        resolve_default_endpoint(&cb, endpoint)
    }

    #[test]
    fn resolves_placeholders() {
        assert_eq!(
            resolve(&["10.0.0.1", "fd00::1"], "0.0.0.0:8080"),
            Some(("10.0.0.1".to_string(), 8080))
        );
        assert_eq!(
            resolve(&["fd00::1"], "0.0.0.0:8080"),
            Some(("127.0.0.1".to_string(), 8080))
        );
        assert_eq!(
            resolve(&["10.0.0.1", "fd00::1"], "[::]:8080"),
            Some(("fd00::1".to_string(), 8080))
        );
        assert_eq!(
            resolve(&["10.0.0.1"], "[::]:8080"),
            Some(("::1".to_string(), 8080))
        );
    }

    #[test]
    fn resolves_loopback_by_family() {
        assert_eq!(
            resolve(&["10.0.0.1", "fd00::1"], "127.0.0.1:9090"),
            Some(("127.0.0.1".to_string(), 9090))
        );
        assert_eq!(
            resolve(&["fd00::1"], "127.0.0.1:9090"),
            Some(("::1".to_string(), 9090))
        );
        assert_eq!(
            resolve(&["10.0.0.1", "fd00::1"], "[::1]:9090"),
            Some(("::1".to_string(), 9090))
        );
        assert_eq!(
            resolve(&["10.0.0.1"], "[::1]:9090"),
            Some(("127.0.0.1".to_string(), 9090))
        );
    }

    #[test]
    fn passes_through_other_endpoints() {
        assert_eq!(resolve(&["10.0.0.1"], ""), Some((String::new(), 0)));
        assert_eq!(
            resolve(&["10.0.0.1"], "unix:///var/run/app.sock"),
            Some(("unix:///var/run/app.sock".to_string(), 0))
        );
        assert_eq!(
            resolve(&["10.0.0.1"], "10.1.1.1:7070"),
            Some((String::new(), 7070))
        );
        assert_eq!(
            resolve(&["10.0.0.1"], "[fd00::9]:7070"),
            Some((String::new(), 7070))
        );
    }

    #[test]
    fn rejects_invalid_endpoints() {
        assert_eq!(resolve(&["10.0.0.1"], "127.0.0.1"), None);
        assert_eq!(resolve(&["10.0.0.1"], "127.0.0.1:http"), None);
        assert_eq!(resolve(&["10.0.0.1"], "127.0.0.1:99999"), None);
        assert_eq!(resolve(&["10.0.0.1"], "::1:9090"), None);
        assert_eq!(resolve(&["10.0.0.1"], ":::9090"), None);
        assert_eq!(resolve(&["10.0.0.1"], "[::1]9090"), None);
        assert_eq!(resolve(&["10.0.0.1"], "[[::1]]:9090"), None);
    }
}
