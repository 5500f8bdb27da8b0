//! Upstream TLS configuration. Only configuration is emitted; certificates
//! are served to the proxy separately over SDS.

use crate::resource::{
    Cluster, TlsCertificate, TransportSocket, TransportSocketMatch, UpstreamTlsContext,
    ValidationContext,
};
use maplit::btreemap;
use mesh_cds_controller_core::{
    destination::{ClientTls, TlsMode},
    service::MutualTlsMode,
    Features, ISTIO_MUTUAL_TLS_MODE,
};
use std::borrow::Cow;

/// The SDS secret holding the workload certificate.
pub const SDS_DEFAULT_RESOURCE: &str = "default";

/// The SDS secret holding the mesh root certificate.
pub const SDS_ROOT_RESOURCE: &str = "ROOTCA";

/// Endpoint metadata key matched by the auto-mTLS transport socket matches.
pub const TLS_MODE_MATCH_KEY: &str = "tlsMode";

const CREDENTIAL_PREFIX: &str = "kubernetes://";
const CA_CERT_SUFFIX: &str = "-cacert";

/// Whether TLS settings were supplied by the user or inferred for auto mTLS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum MtlsContext {
    UserSupplied,
    AutoDetected,
}

#[derive(Clone, Debug)]
pub(crate) struct UpstreamTlsOpts<'a> {
    pub service_accounts: &'a [String],
    pub sni: &'a str,
    pub auto_mtls: bool,
    pub mesh_external: bool,
    pub mtls_mode: MutualTlsMode,
}

/// Resolves the TLS settings for an upstream. Mesh mTLS gets the default SNI
/// and service-account SANs unless the user set them; with no settings at
/// all, auto mTLS applies to in-mesh destinations that accept it.
pub(crate) fn upstream_tls_settings<'t>(
    tls: Option<&'t ClientTls>,
    opts: &UpstreamTlsOpts<'_>,
) -> (Option<Cow<'t, ClientTls>>, MtlsContext) {
    if let Some(tls) = tls {
        if tls.mode != TlsMode::IstioMutual {
            return (Some(Cow::Borrowed(tls)), MtlsContext::UserSupplied);
        }
        let sni = if tls.sni.is_empty() {
            opts.sni
        } else {
            tls.sni.as_str()
        };
        let sans = if tls.subject_alt_names.is_empty() {
            opts.service_accounts
        } else {
            tls.subject_alt_names.as_slice()
        };
        return (
            Some(Cow::Owned(istio_mutual(sans, sni))),
            MtlsContext::UserSupplied,
        );
    }

    if opts.mesh_external
        || !opts.auto_mtls
        || matches!(opts.mtls_mode, MutualTlsMode::Unknown | MutualTlsMode::Disable)
    {
        return (None, MtlsContext::UserSupplied);
    }
    (
        Some(Cow::Owned(istio_mutual(opts.service_accounts, opts.sni))),
        MtlsContext::AutoDetected,
    )
}

fn istio_mutual(sans: &[String], sni: &str) -> ClientTls {
    ClientTls {
        mode: TlsMode::IstioMutual,
        subject_alt_names: sans.to_vec(),
        sni: sni.to_string(),
        ..Default::default()
    }
}

/// Sets the cluster's transport socket. Auto-detected mesh mTLS only applies
/// to endpoints that advertise it, falling back to plaintext for the rest.
pub(crate) fn apply_upstream_tls(
    cluster: &mut Cluster,
    tls: Option<&ClientTls>,
    ctx: MtlsContext,
    features: &Features,
) {
    let Some(tls) = tls else {
        return;
    };
    let Some(context) = upstream_tls_context(cluster, tls, features) else {
        return;
    };
    let socket = TransportSocket::Tls(context);

    if tls.mode == TlsMode::IstioMutual && ctx == MtlsContext::AutoDetected {
        cluster.transport_socket = None;
        cluster.transport_socket_matches = vec![
            TransportSocketMatch {
                name: format!("tlsMode-{ISTIO_MUTUAL_TLS_MODE}"),
                r#match: btreemap! {
                    TLS_MODE_MATCH_KEY.to_string() => ISTIO_MUTUAL_TLS_MODE.to_string(),
                },
                transport_socket: socket,
            },
            TransportSocketMatch {
                name: "tlsMode-disabled".to_string(),
                r#match: Default::default(),
                transport_socket: TransportSocket::RawBuffer,
            },
        ];
    } else {
        cluster.transport_socket = Some(socket);
    }
}

fn upstream_tls_context(
    cluster: &Cluster,
    tls: &ClientTls,
    features: &Features,
) -> Option<UpstreamTlsContext> {
    let h2 = cluster.http2_protocol_options.is_some();
    match tls.mode {
        TlsMode::Disable => None,

        TlsMode::IstioMutual => {
            let mut alpn_protocols = vec!["istio-peer-exchange".to_string(), "istio".to_string()];
            if h2 {
                alpn_protocols.push("h2".to_string());
            }
            Some(UpstreamTlsContext {
                sni: tls.sni.clone(),
                alpn_protocols,
                tls_certificate_sds_secret_configs: vec![SDS_DEFAULT_RESOURCE.to_string()],
                validation_context: Some(ValidationContext {
                    sds_secret_config: Some(SDS_ROOT_RESOURCE.to_string()),
                    match_subject_alt_names: tls.subject_alt_names.clone(),
                    trusted_ca: None,
                }),
                ..Default::default()
            })
        }

        TlsMode::Simple | TlsMode::Mutual => {
            let mut context = UpstreamTlsContext {
                sni: tls.sni.clone(),
                alpn_protocols: if h2 { vec!["h2".to_string()] } else { vec![] },
                validation_context: validation_context(tls, features),
                ..Default::default()
            };
            if tls.mode == TlsMode::Mutual {
                if !tls.credential_name.is_empty() {
                    context.tls_certificate_sds_secret_configs =
                        vec![format!("{CREDENTIAL_PREFIX}{}", tls.credential_name)];
                } else if !tls.client_certificate.is_empty() && !tls.private_key.is_empty() {
                    context.tls_certificates = vec![TlsCertificate {
                        certificate_chain: tls.client_certificate.clone(),
                        private_key: tls.private_key.clone(),
                    }];
                } else {
                    tracing::warn!(
                        cluster = %cluster.name,
                        "Mutual TLS requires a client certificate and key or a credential name"
                    );
                    return None;
                }
            }
            Some(context)
        }
    }
}

fn validation_context(tls: &ClientTls, features: &Features) -> Option<ValidationContext> {
    if tls.insecure_skip_verify {
        return None;
    }
    if !tls.credential_name.is_empty() {
        return Some(ValidationContext {
            sds_secret_config: Some(format!(
                "{CREDENTIAL_PREFIX}{}{CA_CERT_SUFFIX}",
                tls.credential_name
            )),
            match_subject_alt_names: tls.subject_alt_names.clone(),
            trusted_ca: None,
        });
    }

    let trusted_ca = if !tls.ca_certificates.is_empty() {
        Some(tls.ca_certificates.clone())
    } else if features.verify_cert_at_client {
        Some("system".to_string())
    } else {
        None
    };
    if trusted_ca.is_none() && tls.subject_alt_names.is_empty() {
        return None;
    }
    Some(ValidationContext {
        trusted_ca,
        sds_secret_config: None,
        match_subject_alt_names: tls.subject_alt_names.clone(),
    })
}
