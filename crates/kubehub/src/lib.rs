//! Ingressify kubehub: kube client construction and Ingress listing.

#![forbid(unsafe_code)]

use std::time::Instant;

use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use metrics::{counter, histogram};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("reading kubeconfig {path}: {source}")]
    Kubeconfig { path: String, source: kube::config::KubeconfigError },
    #[error("inferring cluster config: {0}")]
    Infer(#[from] kube::config::InferConfigError),
    #[error("building kube client: {0}")]
    Build(#[from] kube::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("listing ingresses: {0}")]
    List(#[from] kube::Error),
    #[error("ingress source unavailable: {0}")]
    Unavailable(String),
}

/// Build a client from an explicit kubeconfig path, or infer one (in-cluster, then
/// `$KUBECONFIG` / `~/.kube/config`) when the path is empty.
pub async fn build_client(kubeconfig: &str) -> Result<Client, ClientError> {
    let config = if kubeconfig.is_empty() {
        debug!("no kubeconfig given; inferring cluster config");
        Config::infer().await?
    } else {
        let wrap = |source| ClientError::Kubeconfig { path: kubeconfig.to_string(), source };
        let kc = Kubeconfig::read_from(kubeconfig).map_err(wrap)?;
        Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await.map_err(wrap)?
    };
    info!(cluster = %config.cluster_url, "kube client configured");
    Ok(Client::try_from(config)?)
}

/// Lists the Ingress objects a render cycle works from.
#[async_trait::async_trait]
pub trait IngressSource: Send + Sync {
    async fn list(&self) -> Result<Vec<Ingress>, CollectionError>;
}

/// Lists Ingresses through the Kubernetes API, across all namespaces or one.
pub struct KubeIngressSource {
    client: Client,
    namespace: Option<String>,
}

impl KubeIngressSource {
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        Self { client, namespace: namespace.map(|s| s.to_string()) }
    }

    fn api(&self) -> Api<Ingress> {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl IngressSource for KubeIngressSource {
    async fn list(&self) -> Result<Vec<Ingress>, CollectionError> {
        let started = Instant::now();
        match self.namespace.as_deref() {
            Some(ns) => info!(ns = %ns, "fetching ingress rules"),
            None => info!("fetching ingress rules on all namespaces"),
        }
        let list = self.api().list(&ListParams::default()).await.map_err(|e| {
            error!(error = %e, "failed to list ingresses");
            counter!("ingress_list_failures", 1u64);
            CollectionError::from(e)
        })?;
        histogram!("ingress_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(count = list.items.len(), "ingresses listed");
        Ok(list.items)
    }
}

/// Fixed in-memory source, optionally scoped to a namespace like the API one.
#[derive(Debug, Clone, Default)]
pub struct StaticIngressSource {
    items: Vec<Ingress>,
    namespace: Option<String>,
}

impl StaticIngressSource {
    pub fn new(items: Vec<Ingress>) -> Self { Self { items, namespace: None } }

    pub fn in_namespace(mut self, ns: &str) -> Self {
        self.namespace = Some(ns.to_string());
        self
    }
}

#[async_trait::async_trait]
impl IngressSource for StaticIngressSource {
    async fn list(&self) -> Result<Vec<Ingress>, CollectionError> {
        let items = match self.namespace.as_deref() {
            Some(ns) => self.items.iter().filter(|i| i.metadata.namespace.as_deref() == Some(ns)).cloned().collect(),
            None => self.items.clone(),
        };
        Ok(items)
    }
}
