use crate::{core::Features, generate, snapshot::Snapshot, xds::ConfigGenerator};
use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use std::{io::Write, path::PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[clap(name = "mesh-cds", about = "Generates the clusters of mesh proxies")]
pub struct Args {
    #[clap(long, default_value = "mesh_cds=info,warn", env = "MESH_CDS_LOG")]
    log_level: String,

    #[clap(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    #[clap(flatten)]
    features: FeatureArgs,

    /// A JSON snapshot of the mesh and its proxies.
    #[clap(long, short)]
    snapshot: PathBuf,

    /// Only generates clusters for the named proxy. May be repeated.
    #[clap(long = "proxy")]
    proxies: Vec<String>,

    #[clap(long)]
    pretty: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, clap::Args)]
struct FeatureArgs {
    /// The default limit for connections, pending requests and requests.
    #[clap(
        long,
        default_value = "1024",
        env = "MESH_CDS_DEFAULT_UPSTREAM_CONCURRENCY_THRESHOLD"
    )]
    default_upstream_concurrency_threshold: u32,

    #[clap(long, default_value = "true", action = ArgAction::Set, env = "MESH_CDS_ENABLE_CDS_CACHING")]
    enable_cds_caching: bool,

    /// Rebuilds every cached cluster and aborts if it differs.
    #[clap(long, env = "MESH_CDS_ENABLE_UNSAFE_ASSERTIONS")]
    enable_unsafe_assertions: bool,

    #[clap(long, env = "MESH_CDS_SEND_UNHEALTHY_ENDPOINTS")]
    send_unhealthy_endpoints: bool,

    #[clap(long, env = "MESH_CDS_ENABLE_EDS_FOR_HEADLESS")]
    enable_eds_for_headless: bool,

    #[clap(long, default_value = "true", action = ArgAction::Set, env = "MESH_CDS_ENABLE_INBOUND_PASSTHROUGH")]
    enable_inbound_passthrough: bool,

    #[clap(long, env = "MESH_CDS_ENABLE_SIDECAR_SERVICE_INBOUND_LISTENER_MERGE")]
    enable_sidecar_service_inbound_listener_merge: bool,

    /// Limits gateways to the clusters of the hosts they route to.
    #[clap(long, env = "MESH_CDS_FILTER_GATEWAY_CLUSTER_CONFIG")]
    filter_gateway_cluster_config: bool,

    #[clap(long, env = "MESH_CDS_VERIFY_CERT_AT_CLIENT")]
    verify_cert_at_client: bool,

    #[clap(long, default_value = "true", action = ArgAction::Set, env = "MESH_CDS_ENABLE_TELEMETRY_LABEL")]
    enable_telemetry_label: bool,

    #[clap(
        long,
        default_value = "istio.io/persistent-session",
        env = "MESH_CDS_PERSISTENT_SESSION_LABEL"
    )]
    persistent_session_label: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            features,
            snapshot,
            proxies,
            pretty,
        } = self;

        log_format.try_init(&log_level)?;

        let mut model = Snapshot::load(&snapshot).await?.into_model()?;
        model.retain_proxies(&proxies)?;
        let version = model.push.version.clone();

        let generator = ConfigGenerator::new(features.into());
        let outputs = tokio::select! {
            res = generate(generator.clone(), model) => res?,
            _ = tokio::signal::ctrl_c() => bail!("interrupted"),
        };
        info!(
            %version,
            proxies = outputs.len(),
            cached = generator.cache().len(),
            "Generated clusters"
        );

        let mut stdout = std::io::stdout().lock();
        if pretty {
            serde_json::to_writer_pretty(&mut stdout, &outputs)?;
        } else {
            serde_json::to_writer(&mut stdout, &outputs)?;
        }
        writeln!(stdout).context("failed to write clusters")?;
        Ok(())
    }
}

// === impl LogFormat ===

impl LogFormat {
    /// Installs the global subscriber. Logs go to stderr so that stdout only
    /// carries clusters.
    pub fn try_init(self, filter: &str) -> Result<()> {
        let filter =
            EnvFilter::try_new(filter).with_context(|| format!("invalid log filter {filter:?}"))?;
        let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        let registry = tracing_subscriber::registry().with(filter);
        match self {
            Self::Plain => registry.with(fmt).try_init()?,
            Self::Json => registry.with(fmt.json()).try_init()?,
        }
        Ok(())
    }
}

// === impl FeatureArgs ===

impl From<FeatureArgs> for Features {
    fn from(args: FeatureArgs) -> Self {
        let FeatureArgs {
            default_upstream_concurrency_threshold,
            enable_cds_caching,
            enable_unsafe_assertions,
            send_unhealthy_endpoints,
            enable_eds_for_headless,
            enable_inbound_passthrough,
            enable_sidecar_service_inbound_listener_merge,
            filter_gateway_cluster_config,
            verify_cert_at_client,
            enable_telemetry_label,
            persistent_session_label,
        } = args;
        Self {
            default_upstream_concurrency_threshold,
            enable_cds_caching,
            enable_unsafe_assertions,
            send_unhealthy_endpoints,
            enable_eds_for_headless,
            enable_inbound_passthrough,
            enable_sidecar_service_inbound_listener_merge,
            filter_gateway_cluster_config,
            verify_cert_at_client,
            enable_telemetry_label,
            persistent_session_label,
        }
    }
}
