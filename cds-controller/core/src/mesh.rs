use crate::{
    destination::{LocalityLbSetting, TcpKeepalive},
    duration,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Mesh-wide settings shared by every proxy in a generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    #[serde(with = "duration")]
    pub connect_timeout: Duration,
    pub tcp_keepalive: Option<TcpKeepalive>,
    pub locality_lb_setting: Option<LocalityLbSetting>,

    /// A pattern used to build the alternate stat name of outbound clusters,
    /// e.g. `%SERVICE%_%SERVICE_PORT%`.
    pub outbound_cluster_stat_name: String,
    pub inbound_cluster_stat_name: String,
    pub enable_auto_mtls: bool,
    #[serde(with = "duration")]
    pub dns_refresh_rate: Duration,
    pub root_namespace: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            tcp_keepalive: None,
            locality_lb_setting: None,
            outbound_cluster_stat_name: String::new(),
            inbound_cluster_stat_name: String::new(),
            enable_auto_mtls: true,
            dns_refresh_rate: Duration::from_secs(60),
            root_namespace: "istio-system".to_string(),
        }
    }
}
