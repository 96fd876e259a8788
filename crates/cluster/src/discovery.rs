//! Sources of candidate worker addresses.
//!
//! Local mode returns a fixed address list (by default the loopback
//! ComfyUI port). Cluster mode lists the worker pods through the
//! Kubernetes API server using the pod's service account.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::PoolError;

/// Mount point of the in-cluster service-account credentials.
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Produces the addresses a discovery cycle should probe.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn candidates(&self) -> Result<Vec<String>, PoolError>;
}

/// Fixed address list, used in dev mode and tests.
#[derive(Debug, Clone)]
pub struct LocalDiscovery {
    addresses: Vec<String>,
}

impl LocalDiscovery {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }

    /// A single worker on `127.0.0.1:{port}`.
    pub fn loopback(port: u16) -> Self {
        Self::new(vec![format!("127.0.0.1:{port}")])
    }
}

#[async_trait]
impl Discovery for LocalDiscovery {
    async fn candidates(&self) -> Result<Vec<String>, PoolError> {
        Ok(self.addresses.clone())
    }
}

/// Lists pods matching a label selector in one namespace.
pub struct KubernetesDiscovery {
    client: reqwest::Client,
    api_server: String,
    token: String,
    namespace: String,
    label_selector: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    status: Option<PodStatus>,
}

#[derive(Debug, Deserialize)]
struct PodStatus {
    #[serde(rename = "podIP", default)]
    pod_ip: Option<String>,
}

impl KubernetesDiscovery {
    /// Build from the in-cluster environment.
    ///
    /// Reads `KUBERNETES_SERVICE_HOST` / `KUBERNETES_SERVICE_PORT` and the
    /// mounted service-account token and CA certificate.
    pub fn in_cluster(
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
        port: u16,
    ) -> Result<Self, PoolError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            PoolError::Discovery("KUBERNETES_SERVICE_HOST is not set; not running in a cluster?".into())
        })?;
        let api_port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = read_credential(&dir.join("token"))?;
        let ca = std::fs::read(dir.join("ca.crt"))
            .map_err(|e| PoolError::Discovery(format!("cannot read cluster CA: {e}")))?;
        let certificate = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| PoolError::Discovery(format!("invalid cluster CA: {e}")))?;
        let client = reqwest::Client::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|e| PoolError::Discovery(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_server: format!("https://{host}:{api_port}"),
            token: token.trim().to_string(),
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            port,
        })
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.api_server, self.namespace)
    }
}

#[async_trait]
impl Discovery for KubernetesDiscovery {
    async fn candidates(&self) -> Result<Vec<String>, PoolError> {
        let response = self
            .client
            .get(self.pods_url())
            .bearer_auth(&self.token)
            .query(&[("labelSelector", self.label_selector.as_str())])
            .send()
            .await
            .map_err(|e| PoolError::Discovery(format!("pod list request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PoolError::Discovery(format!(
                "pod list returned {status}: {body}"
            )));
        }

        let pods: PodList = response
            .json()
            .await
            .map_err(|e| PoolError::Discovery(format!("unexpected pod list: {e}")))?;
        let addresses = pod_addresses(&pods, self.port);
        tracing::debug!(
            namespace = %self.namespace,
            count = addresses.len(),
            "Listed worker pods",
        );
        Ok(addresses)
    }
}

fn read_credential(path: &Path) -> Result<String, PoolError> {
    std::fs::read_to_string(path)
        .map_err(|e| PoolError::Discovery(format!("cannot read {}: {e}", path.display())))
}

/// `ip:port` for every pod that has been assigned an IP.
fn pod_addresses(pods: &PodList, port: u16) -> Vec<String> {
    pods.items
        .iter()
        .filter_map(|pod| pod.status.as_ref()?.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
        .map(|ip| format!("{ip}:{port}"))
        .collect()
}
