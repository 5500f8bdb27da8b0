use crate::{
    core::{Proxy, PushRequest, WatchedResource},
    snapshot::{Model, ProxyModel},
    xds::ConfigGenerator,
};
use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info_span};

/// The clusters generated for one proxy.
#[derive(Debug, Serialize)]
pub struct ProxyClusters {
    pub proxy: String,
    pub version: String,
    pub delta: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    pub clusters: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

/// Generates the clusters of every proxy in the model, in parallel. Outputs
/// are returned in the model's proxy order.
pub async fn generate(generator: ConfigGenerator, model: Model) -> Result<Vec<ProxyClusters>> {
    let Model {
        push,
        configs_updated,
        proxies,
    } = model;

    let tasks = proxies.into_iter().map(|ProxyModel { proxy, watched }| {
        let generator = generator.clone();
        let req = PushRequest {
            push: push.clone(),
            configs_updated: configs_updated.clone(),
        };
        tokio::task::spawn_blocking(move || {
            info_span!("proxy", id = %proxy.id)
                .in_scope(|| generate_proxy(&generator, &proxy, &req, watched.as_ref()))
        })
    });

    futures::future::try_join_all(tasks)
        .await
        .context("cluster generation panicked")?
        .into_iter()
        .collect()
}

fn generate_proxy(
    generator: &ConfigGenerator,
    proxy: &Proxy,
    req: &PushRequest,
    watched: Option<&WatchedResource>,
) -> Result<ProxyClusters> {
    let rsp = match watched {
        Some(watched) => generator.build_delta_clusters(proxy, req, watched),
        None => generator.build_clusters(proxy, req),
    }
    .with_context(|| format!("failed to generate clusters for {}", proxy.id))?;

    debug!(
        clusters = rsp.resources.len(),
        removed = rsp.removed.len(),
        delta = rsp.delta,
        cache = rsp.log.as_deref().unwrap_or("disabled"),
        "Generated clusters"
    );

    let clusters = rsp
        .resources
        .iter()
        .map(|r| {
            serde_json::from_slice(&r.body).with_context(|| format!("cluster {} is not valid JSON", r.name))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ProxyClusters {
        proxy: proxy.id.clone(),
        version: req.push.version.clone(),
        delta: rsp.delta,
        log: rsp.log,
        clusters,
        removed: rsp.removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::Features, snapshot::Snapshot};
    use serde_json::json;

    fn mk_model() -> Model {
        let snapshot = json!({
            "version": "1",
            "services": [{
                "hostname": "foo.ns-0.svc.cluster.local",
                "ports": [{ "name": "http", "port": 80, "protocol": "HTTP" }],
                "attributes": { "name": "foo", "namespace": "ns-0" },
            }],
            "configs_updated": [
                { "kind": "ServiceEntry", "name": "bar.ns-0.svc.cluster.local", "namespace": "ns-0" },
            ],
            "proxies": [
                { "id": "a.ns-0", "namespace": "ns-0", "ip_addresses": ["10.0.0.1"] },
                { "id": "b.ns-0", "namespace": "ns-0", "ip_addresses": ["10.0.0.2"] },
                {
                    "id": "c.ns-0",
                    "namespace": "ns-0",
                    "ip_addresses": ["10.0.0.3"],
                    "watched": [
                        "outbound|80||foo.ns-0.svc.cluster.local",
                        "outbound|80||bar.ns-0.svc.cluster.local",
                    ],
                },
            ],
        });
        serde_json::from_value::<Snapshot>(snapshot)
            .expect("snapshot must parse")
            .into_model()
            .expect("snapshot must be valid")
    }

    fn names(output: &ProxyClusters) -> Vec<&str> {
        output
            .clusters
            .iter()
            .filter_map(|c| c["name"].as_str())
            .collect()
    }

    #[tokio::test]
    async fn generates_every_proxy_in_order() {
        let generator = ConfigGenerator::new(Features::default());
        let outputs = generate(generator.clone(), mk_model())
            .await
            .expect("generation must succeed");

        assert_eq!(
            outputs.iter().map(|o| o.proxy.as_str()).collect::<Vec<_>>(),
            vec!["a.ns-0", "b.ns-0", "c.ns-0"]
        );

        let full = &outputs[0];
        assert!(!full.delta);
        assert_eq!(full.version, "1");
        assert!(names(full).contains(&"outbound|80||foo.ns-0.svc.cluster.local"));
        assert_eq!(names(full), names(&outputs[1]));
        assert!(full.removed.is_empty());

        // Sidecars share a scope, so they share cached clusters.
        assert_eq!(generator.cache().len(), 1);
    }

    #[tokio::test]
    async fn watching_proxies_receive_deltas() {
        let generator = ConfigGenerator::new(Features::default());
        let outputs = generate(generator, mk_model())
            .await
            .expect("generation must succeed");

        let delta = &outputs[2];
        assert!(delta.delta);
        assert!(!names(delta).iter().any(|n| n.starts_with("outbound|")));
        assert_eq!(delta.removed, vec!["outbound|80||bar.ns-0.svc.cluster.local"]);
    }

    #[tokio::test]
    async fn empty_models_generate_nothing() {
        let generator = ConfigGenerator::new(Features::default());
        let model = Model {
            push: Default::default(),
            configs_updated: Default::default(),
            proxies: Vec::new(),
        };
        let outputs = generate(generator, model).await.expect("generation must succeed");
        assert!(outputs.is_empty());
    }
}
