//! Cluster names are derived structurally from the traffic direction, port,
//! subset and hostname so that they are unique per proxy and stable across
//! generations.

use std::fmt;

/// The traffic direction a cluster serves.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrafficDirection {
    Inbound,
    InboundVip,
    Outbound,
}

/// A parsed cluster name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubsetKey<'n> {
    pub direction: TrafficDirection,
    pub subset: &'n str,
    pub hostname: &'n str,
    pub port: u16,
}

// === impl TrafficDirection ===

impl TrafficDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::InboundVip => "inbound-vip",
            Self::Outbound => "outbound",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "inbound-vip" => Some(Self::InboundVip),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

impl fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// Builds a `direction|port|subset|hostname` cluster name.
pub fn build_subset_key(
    direction: TrafficDirection,
    subset: &str,
    hostname: &str,
    port: u16,
) -> String {
    format!("{direction}|{port}|{subset}|{hostname}")
}

/// Builds the name of an inbound cluster for a workload port.
pub fn build_inbound_subset_key(port: u16) -> String {
    build_subset_key(TrafficDirection::Inbound, "", "", port)
}

/// Builds a `direction_.port_.subset_.hostname` name, which is usable as an
/// SNI value.
pub fn build_dns_srv_subset_key(
    direction: TrafficDirection,
    subset: &str,
    hostname: &str,
    port: u16,
) -> String {
    format!("{direction}_.{port}_.{subset}_.{hostname}")
}

/// Parses either form of cluster name. Names that were not produced by one of
/// the builders above yield `None`.
pub fn parse_subset_key(name: &str) -> Option<SubsetKey<'_>> {
    if name.contains('|') {
        parse_parts(name.splitn(4, '|'))
    } else {
        // Subsets and hostnames are themselves dot-separated, so only the `_.`
        // sequence delimits the SNI form.
        parse_parts(name.splitn(4, "_."))
    }
}

fn parse_parts<'n>(mut parts: impl Iterator<Item = &'n str>) -> Option<SubsetKey<'n>> {
    let direction = TrafficDirection::parse(parts.next()?)?;
    let port = parts.next()?.parse().ok()?;
    let subset = parts.next()?;
    let hostname = parts.next()?;
    Some(SubsetKey {
        direction,
        subset,
        hostname,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_names() {
        assert_eq!(
            build_subset_key(TrafficDirection::Outbound, "v1", "foo.ns.svc.cluster.local", 80),
            "outbound|80|v1|foo.ns.svc.cluster.local"
        );
        assert_eq!(build_inbound_subset_key(8080), "inbound|8080||");
        assert_eq!(
            build_dns_srv_subset_key(TrafficDirection::Outbound, "", "foo.ns", 443),
            "outbound_.443_._.foo.ns"
        );
        assert_eq!(
            build_subset_key(TrafficDirection::InboundVip, "http/v1", "foo.ns", 80),
            "inbound-vip|80|http/v1|foo.ns"
        );
    }

    #[test]
    fn parses_pipe_form() {
        let key = parse_subset_key("outbound|9080|v2|reviews.default.svc.cluster.local")
            .expect("must parse");
        assert_eq!(
            key,
            SubsetKey {
                direction: TrafficDirection::Outbound,
                subset: "v2",
                hostname: "reviews.default.svc.cluster.local",
                port: 9080,
            }
        );

        let key = parse_subset_key("inbound|8080||").expect("must parse");
        assert_eq!(key.direction, TrafficDirection::Inbound);
        assert_eq!(key.hostname, "");
        assert_eq!(key.port, 8080);
    }

    #[test]
    fn parses_sni_form() {
        let key = parse_subset_key("outbound_.80_.v1.beta_.foo.ns.svc").expect("must parse");
        assert_eq!(key.subset, "v1.beta");
        assert_eq!(key.hostname, "foo.ns.svc");
        assert_eq!(key.port, 80);
    }

    #[test]
    fn rejects_unstructured_names() {
        assert_eq!(parse_subset_key("BlackHoleCluster"), None);
        assert_eq!(parse_subset_key("outbound|http|v1|foo"), None);
        assert_eq!(parse_subset_key("sideways|80||foo"), None);
        assert_eq!(parse_subset_key("outbound|80|v1"), None);
    }
}
