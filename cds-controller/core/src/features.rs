/// Process-wide generation switches. A generator holds one value for its
/// whole lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Features {
    /// The default limit for connections, pending requests and requests.
    pub default_upstream_concurrency_threshold: u32,
    pub enable_cds_caching: bool,

    /// Rebuilds cached clusters and panics if they differ from the cached
    /// bytes.
    pub enable_unsafe_assertions: bool,
    pub send_unhealthy_endpoints: bool,
    pub enable_eds_for_headless: bool,
    pub enable_inbound_passthrough: bool,
    pub enable_sidecar_service_inbound_listener_merge: bool,
    pub filter_gateway_cluster_config: bool,
    pub verify_cert_at_client: bool,
    pub enable_telemetry_label: bool,

    /// Services carrying this label keep draining and unhealthy endpoints
    /// eligible for sticky sessions.
    pub persistent_session_label: String,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            default_upstream_concurrency_threshold: 1024,
            enable_cds_caching: true,
            enable_unsafe_assertions: false,
            send_unhealthy_endpoints: false,
            enable_eds_for_headless: false,
            enable_inbound_passthrough: true,
            enable_sidecar_service_inbound_listener_merge: false,
            filter_gateway_cluster_config: false,
            verify_cert_at_client: false,
            enable_telemetry_label: true,
            persistent_session_label: "istio.io/persistent-session".to_string(),
        }
    }
}
