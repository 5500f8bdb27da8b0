//! Locality-aware load balancing: weighted distribution and priority failover
//! over a cluster's endpoint groups.

use crate::resource::ClusterLoadAssignment;
use mesh_cds_controller_core::{
    destination::{LocalityDistribute, LocalityFailover, LocalityLbSetting},
    proxy::Locality,
};
use std::collections::{BTreeMap, BTreeSet};

/// Returns the locality setting that applies: the destination policy's unless
/// it is disabled there, and otherwise the mesh's unless it is disabled.
pub fn locality_lb_setting<'s>(
    mesh: Option<&'s LocalityLbSetting>,
    destination: Option<&'s LocalityLbSetting>,
) -> Option<&'s LocalityLbSetting> {
    let mut enabled = mesh.map(|m| m.enabled != Some(false)).unwrap_or(false);
    if let Some(dr) = destination {
        enabled = dr.enabled != Some(false);
    }
    if !enabled {
        return None;
    }
    destination.or(mesh)
}

/// Distribution takes precedence over failover. Failover only applies when
/// `enable_failover` is set, since without outlier detection the proxy never
/// moves traffic to a lower priority.
pub fn apply_locality_load_balancer(
    locality: &Locality,
    load_assignment: &mut ClusterLoadAssignment,
    setting: &LocalityLbSetting,
    enable_failover: bool,
) {
    if !setting.distribute.is_empty() {
        apply_locality_weights(locality, load_assignment, &setting.distribute);
    } else if enable_failover {
        apply_locality_failover(locality, load_assignment, &setting.failover);
    }
}

fn apply_locality_weights(
    locality: &Locality,
    load_assignment: &mut ClusterLoadAssignment,
    distribute: &[LocalityDistribute],
) {
    let Some(setting) = distribute.iter().find(|d| locality_match(Some(locality), &d.from)) else {
        return;
    };

    let mut unmatched = (0..load_assignment.endpoints.len()).collect::<BTreeSet<_>>();
    for (to, weight) in &setting.to {
        let mut original = BTreeMap::new();
        let mut total = 0u64;
        for i in unmatched.clone() {
            let group = &load_assignment.endpoints[i];
            if locality_match(group.locality.as_ref(), to) {
                unmatched.remove(&i);
                let w = group.load_balancing_weight.unwrap_or(1);
                original.insert(i, w);
                total += u64::from(w);
            }
        }

        // A wildcard may select several groups, which then share the weight in
        // proportion to their own.
        for (i, w) in original {
            let dest = (u64::from(w) * u64::from(*weight)) as f64 / total as f64;
            if dest > 0.0 {
                load_assignment.endpoints[i].load_balancing_weight = Some(dest.ceil() as u32);
            }
        }
    }

    for i in unmatched {
        load_assignment.endpoints[i].lb_endpoints.clear();
    }
}

fn apply_locality_failover(
    locality: &Locality,
    load_assignment: &mut ClusterLoadAssignment,
    failover: &[LocalityFailover],
) {
    let mut by_priority = BTreeMap::<u32, Vec<usize>>::new();
    for (i, group) in load_assignment.endpoints.iter_mut().enumerate() {
        let mut priority = lb_priority(locality, group.locality.as_ref());
        if priority == 3 {
            if let Some(f) = failover.iter().find(|f| f.from == locality.region) {
                let region = group.locality.as_ref().map(|l| l.region.as_str());
                if region != Some(f.to.as_str()) {
                    priority = 4;
                }
            }
        }
        group.priority = priority;
        by_priority.entry(priority).or_default().push(i);
    }

    // Priorities must be dense, starting at zero.
    for (dense, indices) in by_priority.values().enumerate() {
        for i in indices {
            load_assignment.endpoints[*i].priority = dense as u32;
        }
    }
}

/// Ranks an endpoint locality by how closely it matches the proxy's: 0 when
/// the subzone matches, 1 for the zone, 2 for the region and 3 otherwise.
pub fn lb_priority(proxy: &Locality, endpoints: Option<&Locality>) -> u32 {
    let (region, zone, subzone) = match endpoints {
        Some(l) => (l.region.as_str(), l.zone.as_str(), l.subzone.as_str()),
        None => ("", "", ""),
    };
    if proxy.region != region {
        return 3;
    }
    if proxy.zone != zone {
        return 2;
    }
    if proxy.subzone != subzone {
        return 1;
    }
    0
}

/// Matches a locality against a `region/zone/subzone` rule in which any part
/// may be `*` and trailing parts may be omitted.
pub fn locality_match(locality: Option<&Locality>, rule: &str) -> bool {
    let rule = Locality::parse(rule);
    let (region, zone, subzone) = match locality {
        Some(l) => (l.region.as_str(), l.zone.as_str(), l.subzone.as_str()),
        None => ("", "", ""),
    };
    let region_match = rule.region == "*" || rule.region == region;
    let zone_match = rule.zone == "*" || rule.zone.is_empty() || rule.zone == zone;
    let subzone_match = rule.subzone == "*" || rule.subzone.is_empty() || rule.subzone == subzone;
    region_match && zone_match && subzone_match
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Address, LbEndpoint, LocalityLbEndpoints, Metadata};
    use maplit::btreemap;

    fn mk_group(locality: &str) -> LocalityLbEndpoints {
        LocalityLbEndpoints {
            locality: Some(Locality::parse(locality)),
            lb_endpoints: vec![LbEndpoint {
                address: Address::Socket {
                    address: "10.0.0.1".to_string(),
                    port: 80,
                },
                load_balancing_weight: Some(1),
                metadata: Metadata::default(),
            }],
            load_balancing_weight: Some(1),
            priority: 0,
        }
    }

    fn mk_assignment(localities: &[&str]) -> ClusterLoadAssignment {
        ClusterLoadAssignment {
            cluster_name: "outbound|80||foo".to_string(),
            endpoints: localities.iter().map(|l| mk_group(l)).collect(),
        }
    }

    #[test]
    fn priorities() {
        let proxy = Locality::parse("r1/z1/s1");
        assert_eq!(lb_priority(&proxy, Some(&Locality::parse("r1/z1/s1"))), 0);
        assert_eq!(lb_priority(&proxy, Some(&Locality::parse("r1/z1/s2"))), 1);
        assert_eq!(lb_priority(&proxy, Some(&Locality::parse("r1/z2/s1"))), 2);
        assert_eq!(lb_priority(&proxy, Some(&Locality::parse("r2/z1/s1"))), 3);
        assert_eq!(lb_priority(&proxy, None), 3);
    }

    #[test]
    fn locality_rules() {
        let l = Locality::parse("r1/z1/s1");
        assert!(locality_match(Some(&l), "r1"));
        assert!(locality_match(Some(&l), "r1/*"));
        assert!(locality_match(Some(&l), "r1/z1/s1"));
        assert!(locality_match(Some(&l), "*"));
        assert!(!locality_match(Some(&l), "r1/z2"));
        assert!(!locality_match(Some(&l), "r2/*"));
        assert!(!locality_match(None, "r1"));
    }

    #[test]
    fn failover_priorities_are_dense() {
        let proxy = Locality::parse("r1/z1/s1");
        let mut la = mk_assignment(&["r1/z1/s1", "r2/z1/s1", "r3/z1/s1", "r1/z2/s1"]);
        let failover = vec![LocalityFailover {
            from: "r1".to_string(),
            to: "r2".to_string(),
        }];
        apply_locality_failover(&proxy, &mut la, &failover);
        let priorities = la.endpoints.iter().map(|e| e.priority).collect::<Vec<_>>();
        // Raw priorities 0, 3, 4, 2 become 0, 2, 3, 1.
        assert_eq!(priorities, vec![0, 2, 3, 1]);
    }

    #[test]
    fn distribute_weights() {
        let proxy = Locality::parse("r1/z1/s1");
        let mut la = mk_assignment(&["r1/z1/s1", "r1/z2/s1", "r2/z1/s1"]);
        let distribute = vec![LocalityDistribute {
            from: "r1/z1/*".to_string(),
            to: btreemap! {
                "r1/z1/*".to_string() => 80,
                "r1/z2/*".to_string() => 20,
            },
        }];
        apply_locality_weights(&proxy, &mut la, &distribute);
        assert_eq!(la.endpoints[0].load_balancing_weight, Some(80));
        assert_eq!(la.endpoints[1].load_balancing_weight, Some(20));
        assert!(la.endpoints[2].lb_endpoints.is_empty());
    }

    #[test]
    fn wildcard_destinations_share_weight() {
        let proxy = Locality::parse("r1/z1/s1");
        let mut la = mk_assignment(&["r2/z1/s1", "r2/z2/s1"]);
        let distribute = vec![LocalityDistribute {
            from: "*".to_string(),
            to: btreemap! { "r2/*".to_string() => 100 },
        }];
        apply_locality_weights(&proxy, &mut la, &distribute);
        assert_eq!(la.endpoints[0].load_balancing_weight, Some(50));
        assert_eq!(la.endpoints[1].load_balancing_weight, Some(50));
    }

    #[test]
    fn setting_selection() {
        let mesh = LocalityLbSetting::default();
        let disabled = LocalityLbSetting {
            enabled: Some(false),
            ..Default::default()
        };
        assert_eq!(locality_lb_setting(Some(&mesh), None), Some(&mesh));
        assert_eq!(locality_lb_setting(Some(&mesh), Some(&disabled)), None);
        assert_eq!(locality_lb_setting(Some(&disabled), None), None);
        assert_eq!(locality_lb_setting(None, None), None);
    }
}
