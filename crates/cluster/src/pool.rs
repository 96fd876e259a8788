//! Worker pool: the node registry kept current by a background
//! discovery task.
//!
//! [`WorkerPool::start`] runs one discovery cycle, then spawns a task
//! that repeats it every `discovery_interval` until [`WorkerPool::close`]
//! is called. Closing stops discovery only; leases already handed out
//! stay valid and are released as usual.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::discovery::Discovery;
use crate::error::PoolError;
use crate::probe::{HttpProbe, Probe};
use crate::registry::{DiscoverySummary, NodeLease, NodeRegistry};

/// How long [`WorkerPool::close`] waits for the discovery task to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Probes discovery candidates and applies the result to the registry.
#[derive(Clone)]
struct Refresher {
    registry: Arc<NodeRegistry>,
    discovery: Arc<dyn Discovery>,
    probe: Arc<dyn Probe>,
}

impl Refresher {
    async fn refresh(&self) -> Result<DiscoverySummary, PoolError> {
        let candidates = self.discovery.candidates().await?;
        let probes = candidates.iter().map(|address| self.probe.is_alive(address));
        let alive = join_all(probes).await;

        let confirmed: Vec<String> = candidates
            .into_iter()
            .zip(alive)
            .filter_map(|(address, ok)| ok.then_some(address))
            .collect();

        let summary = self.registry.apply_discovery(&confirmed);
        tracing::info!(
            cycle = summary.cycle,
            confirmed = confirmed.len(),
            added = summary.added,
            restored = summary.restored,
            evicted = summary.evicted,
            total = summary.total,
            "Discovery cycle complete",
        );
        Ok(summary)
    }
}

/// Process-wide pool of worker nodes.
pub struct WorkerPool {
    refresher: Refresher,
    cancel: CancellationToken,
    /// Claimed by the first `start`; later calls return at once.
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Pool without a background task; call [`Self::refresh_discovery`]
    /// to populate it.
    pub fn new(
        registry: Arc<NodeRegistry>,
        discovery: Arc<dyn Discovery>,
        probe: Arc<dyn Probe>,
    ) -> Self {
        Self {
            refresher: Refresher {
                registry,
                discovery,
                probe,
            },
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Build the pool described by `config` and start discovery.
    pub async fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        let pool = Self::new(
            Arc::new(config.registry()),
            config.discovery()?,
            Arc::new(HttpProbe::new(config.probe_timeout)),
        );
        pool.start(config.discovery_interval).await;
        Ok(pool)
    }

    /// Run one discovery cycle now, then keep refreshing every `interval`.
    ///
    /// A failed cycle is logged and retried on the next tick. Only the
    /// first call starts anything, even when calls race.
    pub async fn start(&self, interval: Duration) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.refresh_discovery().await {
            tracing::error!(error = %e, "Initial discovery failed");
        }

        let refresher = self.refresher.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the initial cycle already ran.
            ticker.tick().await;
            tracing::info!(
                interval_secs = interval.as_secs(),
                "Background discovery started",
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("Background discovery stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = refresher.refresh().await {
                            tracing::error!(error = %e, "Discovery cycle failed");
                        }
                    }
                }
            }
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Run one discovery cycle.
    pub async fn refresh_discovery(&self) -> Result<DiscoverySummary, PoolError> {
        self.refresher.refresh().await
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.refresher.registry
    }

    /// Lease a node, waiting for capacity per the registry's policy.
    pub async fn lease(&self) -> Result<NodeLease, PoolError> {
        self.refresher.registry.lease().await
    }

    /// Stop background discovery. In-flight leases are not affected.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
