//! Liveness probes run against discovered addresses.

use std::time::Duration;

use async_trait::async_trait;

/// Default timeout for one probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cheap reachability check for a candidate address.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn is_alive(&self, address: &str) -> bool;
}

/// Probe that expects `200 OK` from `GET http://{address}/`.
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), timeout)
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn is_alive(&self, address: &str) -> bool {
        let result = self
            .client
            .get(format!("http://{address}/"))
            .timeout(self.timeout)
            .send()
            .await;

        match result {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::debug!(address, error = %e, "Liveness probe failed");
                false
            }
        }
    }
}
