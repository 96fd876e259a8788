use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::discovery::{Discovery, KubernetesDiscovery, LocalDiscovery};
use crate::error::PoolError;
use crate::registry::{LeasePolicy, NodeRegistry};

/// Worker pool configuration loaded from environment variables.
///
/// Defaults match a cluster deployment; `DEV_MODE=true` switches to a
/// single local worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Use the loopback worker instead of querying the cluster.
    pub dev_mode: bool,
    /// Port the workers listen on (default: `8188`).
    pub comfy_port: u16,
    pub namespace: String,
    pub label_selector: String,
    /// Period of the background discovery task (default: 60s).
    pub discovery_interval: Duration,
    /// Timeout of one liveness probe (default: 5s).
    pub probe_timeout: Duration,
    pub lease: LeasePolicy,
    /// Evict idle nodes unseen for this many cycles. `None` keeps them.
    pub evict_after_missed_cycles: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            comfy_port: 8188,
            namespace: "batch".into(),
            label_selector: "app=comfy-ui".into(),
            discovery_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            lease: LeasePolicy::default(),
            evict_after_missed_cycles: None,
        }
    }
}

impl PoolConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default        |
    /// |-----------------------------|----------------|
    /// | `DEV_MODE`                  | `false`        |
    /// | `COMFY_PORT`                | `8188`         |
    /// | `CLUSTER_NAMESPACE`         | `batch`        |
    /// | `CLUSTER_LABEL_SELECTOR`    | `app=comfy-ui` |
    /// | `DISCOVERY_INTERVAL_SECS`   | `60`           |
    /// | `PROBE_TIMEOUT_SECS`        | `5`            |
    /// | `LEASE_MAX_ATTEMPTS`        | `15`           |
    /// | `EVICT_AFTER_MISSED_CYCLES` | unset          |
    pub fn from_env() -> Result<Self, PoolError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with a custom variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PoolError> {
        let defaults = Self::default();

        let dev_mode = lookup("DEV_MODE")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let comfy_port = parse_var(&lookup, "COMFY_PORT")?.unwrap_or(defaults.comfy_port);
        let namespace = lookup("CLUSTER_NAMESPACE").unwrap_or(defaults.namespace);
        let label_selector = lookup("CLUSTER_LABEL_SELECTOR").unwrap_or(defaults.label_selector);

        let discovery_interval = parse_var(&lookup, "DISCOVERY_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.discovery_interval);
        if discovery_interval.is_zero() {
            return Err(PoolError::Config(
                "DISCOVERY_INTERVAL_SECS must be greater than 0".into(),
            ));
        }

        let probe_timeout = parse_var(&lookup, "PROBE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.probe_timeout);

        let max_attempts =
            parse_var(&lookup, "LEASE_MAX_ATTEMPTS")?.unwrap_or(defaults.lease.max_attempts);
        if max_attempts == 0 {
            return Err(PoolError::Config(
                "LEASE_MAX_ATTEMPTS must be greater than 0".into(),
            ));
        }
        let lease = LeasePolicy {
            max_attempts,
            ..defaults.lease
        };

        let evict_after_missed_cycles = parse_var(&lookup, "EVICT_AFTER_MISSED_CYCLES")?;

        Ok(Self {
            dev_mode,
            comfy_port,
            namespace,
            label_selector,
            discovery_interval,
            probe_timeout,
            lease,
            evict_after_missed_cycles,
        })
    }

    /// Discovery source for the configured mode.
    pub fn discovery(&self) -> Result<Arc<dyn Discovery>, PoolError> {
        if self.dev_mode {
            return Ok(Arc::new(LocalDiscovery::loopback(self.comfy_port)));
        }
        let discovery =
            KubernetesDiscovery::in_cluster(&self.namespace, &self.label_selector, self.comfy_port)?;
        Ok(Arc::new(discovery))
    }

    pub fn registry(&self) -> NodeRegistry {
        NodeRegistry::new(self.lease.clone()).with_eviction(self.evict_after_missed_cycles)
    }
}

/// Parse an optional variable.
fn parse_var<T>(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, PoolError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| PoolError::Config(format!("{name}={raw:?} is invalid: {e}"))),
        None => Ok(None),
    }
}
