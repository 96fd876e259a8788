//! Shared node table with mutually exclusive leases.
//!
//! Every read and write of node state goes through one [`Mutex`]
//! covering the whole table, so compound operations such as "find an
//! available node and lease it" are atomic. The lock is never held
//! across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::PoolError;
use crate::node::{NodeState, WorkerNode};

/// Default number of scans before leasing gives up.
pub const DEFAULT_LEASE_ATTEMPTS: u32 = 15;

/// Quadratic wait applied while no node is available.
///
/// Scan `i` (1-indexed) that finds nothing is followed by a wait of
/// `i² * unit`, so the default waits 1, 4, 9, ... 225 seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasePolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_LEASE_ATTEMPTS,
            unit: Duration::from_secs(1),
        }
    }
}

impl LeasePolicy {
    pub fn wait_for_attempt(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt.saturating_mul(attempt))
    }
}

/// Counts from applying one discovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub cycle: u64,
    /// Addresses seen for the first time.
    pub added: usize,
    /// Unresponsive nodes reset to available.
    pub restored: usize,
    /// Nodes dropped for missing too many cycles.
    pub evicted: usize,
    /// Table size after the cycle.
    pub total: usize,
}

#[derive(Debug, Default)]
struct Table {
    nodes: Vec<WorkerNode>,
    cycle: u64,
}

impl Table {
    fn find_mut(&mut self, address: &str) -> Option<&mut WorkerNode> {
        self.nodes.iter_mut().find(|n| n.address == address)
    }
}

/// The pool's node table.
///
/// Nodes are kept in discovery order and leases scan in that order.
#[derive(Debug)]
pub struct NodeRegistry {
    table: Mutex<Table>,
    policy: LeasePolicy,
    evict_after: Option<u64>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(LeasePolicy::default())
    }
}

impl NodeRegistry {
    pub fn new(policy: LeasePolicy) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            policy,
            evict_after: None,
        }
    }

    /// Drop non-leased nodes that have not been confirmed for
    /// `missed_cycles` consecutive discovery cycles.
    pub fn with_eviction(mut self, missed_cycles: Option<u64>) -> Self {
        self.evict_after = missed_cycles.filter(|n| *n > 0);
        self
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.policy
    }

    /// Record the addresses confirmed reachable by one discovery cycle.
    ///
    /// New addresses are inserted as available and unresponsive ones are
    /// reset. Leased and available nodes keep their state whether or not
    /// they were confirmed.
    pub fn apply_discovery(&self, confirmed: &[String]) -> DiscoverySummary {
        let mut table = self.lock();
        table.cycle += 1;
        let cycle = table.cycle;
        let mut summary = DiscoverySummary {
            cycle,
            ..DiscoverySummary::default()
        };

        for address in confirmed {
            match table.find_mut(address) {
                Some(node) => {
                    node.last_seen_cycle = cycle;
                    if node.state == NodeState::Unresponsive {
                        node.state = NodeState::Available;
                        summary.restored += 1;
                    }
                }
                None => {
                    table.nodes.push(WorkerNode::discovered(address.clone(), cycle));
                    summary.added += 1;
                }
            }
        }

        if let Some(limit) = self.evict_after {
            let before = table.nodes.len();
            table.nodes.retain(|node| {
                node.state == NodeState::Leased || cycle - node.last_seen_cycle < limit
            });
            summary.evicted = before - table.nodes.len();
        }

        summary.total = table.nodes.len();
        summary
    }

    /// Lease the first available node, if any, without waiting.
    pub fn try_lease(&self) -> Option<String> {
        let mut table = self.lock();
        let node = table.nodes.iter_mut().find(|n| n.is_available())?;
        node.state = NodeState::Leased;
        Some(node.address.clone())
    }

    /// Lease a node, waiting with quadratic backoff while none is free.
    ///
    /// The returned guard releases the node when dropped.
    pub async fn lease(self: &Arc<Self>) -> Result<NodeLease, PoolError> {
        for attempt in 1..=self.policy.max_attempts {
            if let Some(address) = self.try_lease() {
                tracing::debug!(address = %address, attempt, "Node leased");
                return Ok(NodeLease {
                    registry: Arc::clone(self),
                    address,
                });
            }

            let wait = self.policy.wait_for_attempt(attempt);
            tracing::info!(
                attempt,
                max_attempts = self.policy.max_attempts,
                wait_secs = wait.as_secs(),
                "No worker node available, waiting",
            );
            tokio::time::sleep(wait).await;
        }

        Err(PoolError::Exhausted {
            attempts: self.policy.max_attempts,
        })
    }

    /// Return a leased node to the pool.
    ///
    /// Nodes in any other state, and unknown addresses, are left as they
    /// are.
    pub fn release(&self, address: &str) {
        let mut table = self.lock();
        if let Some(node) = table.find_mut(address) {
            if node.state == NodeState::Leased {
                node.state = NodeState::Available;
            }
        }
    }

    /// Exclude a node from leasing until discovery confirms it again.
    pub fn mark_unresponsive(&self, address: &str) {
        let mut table = self.lock();
        if let Some(node) = table.find_mut(address) {
            node.state = NodeState::Unresponsive;
            node.failures += 1;
        }
    }

    pub fn state_of(&self, address: &str) -> Option<NodeState> {
        self.lock()
            .nodes
            .iter()
            .find(|n| n.address == address)
            .map(|n| n.state)
    }

    /// Copy of the table in discovery order.
    pub fn snapshot(&self) -> Vec<WorkerNode> {
        self.lock().nodes.clone()
    }

    pub fn available_count(&self) -> usize {
        self.lock().nodes.iter().filter(|n| n.is_available()).count()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on one node for the duration of one attempt.
///
/// Dropping the lease releases the node exactly once, whichever way the
/// attempt ended.
#[derive(Debug)]
pub struct NodeLease {
    registry: Arc<NodeRegistry>,
    address: String,
}

impl NodeLease {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Mark the leased node unresponsive. It is still released on drop
    /// and stays excluded until rediscovered.
    pub fn mark_unresponsive(&self) {
        self.registry.mark_unresponsive(&self.address);
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.registry.release(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use tokio::time::Instant;

    use super::*;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn registry_with(list: &[&str]) -> Arc<NodeRegistry> {
        let registry = Arc::new(NodeRegistry::default());
        registry.apply_discovery(&addrs(list));
        registry
    }

    // -- discovery ---------------------------------------------------------

    #[test]
    fn discovery_inserts_new_nodes_in_order() {
        let registry = NodeRegistry::default();
        let summary = registry.apply_discovery(&addrs(&["a:1", "b:1"]));
        assert_eq!(summary.added, 2);
        assert_eq!(summary.total, 2);

        let nodes = registry.snapshot();
        assert_eq!(nodes[0].address, "a:1");
        assert_eq!(nodes[1].address, "b:1");
        assert!(nodes.iter().all(WorkerNode::is_available));
    }

    #[test]
    fn discovery_restores_unresponsive_but_leaves_leased() {
        let registry = registry_with(&["a:1", "b:1"]);
        let leased = registry.try_lease().unwrap();
        registry.mark_unresponsive("b:1");

        let summary = registry.apply_discovery(&addrs(&["a:1", "b:1"]));
        assert_eq!(summary.restored, 1);
        assert_eq!(summary.added, 0);
        assert_eq!(registry.state_of(&leased), Some(NodeState::Leased));
        assert_eq!(registry.state_of("b:1"), Some(NodeState::Available));
    }

    #[test]
    fn unconfirmed_nodes_keep_their_state() {
        let registry = registry_with(&["a:1", "b:1"]);
        registry.apply_discovery(&addrs(&["b:1"]));
        assert_eq!(registry.state_of("a:1"), Some(NodeState::Available));
    }

    #[test]
    fn eviction_drops_absent_idle_nodes_only() {
        let registry = Arc::new(NodeRegistry::default().with_eviction(Some(2)));
        registry.apply_discovery(&addrs(&["a:1", "b:1", "c:1"]));
        let _lease = registry.try_lease().unwrap(); // a:1
        registry.mark_unresponsive("c:1");

        registry.apply_discovery(&[]);
        assert_eq!(registry.snapshot().len(), 3);

        let summary = registry.apply_discovery(&[]);
        assert_eq!(summary.evicted, 2);
        let left: Vec<String> = registry.snapshot().into_iter().map(|n| n.address).collect();
        assert_eq!(left, vec!["a:1".to_string()]);
    }

    // -- lease / release ---------------------------------------------------

    #[test]
    fn lease_release_round_trip() {
        let registry = registry_with(&["a:1"]);
        let address = registry.try_lease().unwrap();
        assert_eq!(registry.state_of(&address), Some(NodeState::Leased));
        assert!(registry.try_lease().is_none());

        registry.release(&address);
        assert_eq!(registry.state_of(&address), Some(NodeState::Available));
        assert_eq!(registry.try_lease().as_deref(), Some("a:1"));
    }

    #[test]
    fn release_of_unknown_node_is_noop() {
        let registry = registry_with(&["a:1"]);
        registry.release("gone:1");
        registry.mark_unresponsive("gone:1");
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn unresponsive_node_is_never_leased_until_rediscovered() {
        let registry = registry_with(&["a:1"]);
        registry.mark_unresponsive("a:1");
        registry.release("a:1");
        assert_eq!(registry.state_of("a:1"), Some(NodeState::Unresponsive));
        assert!(registry.try_lease().is_none());

        registry.apply_discovery(&addrs(&["a:1"]));
        assert_eq!(registry.try_lease().as_deref(), Some("a:1"));
        assert_eq!(registry.snapshot()[0].failures, 1);
    }

    #[tokio::test]
    async fn dropping_lease_releases_node() {
        let registry = registry_with(&["a:1"]);
        {
            let lease = registry.lease().await.unwrap();
            assert_eq!(lease.address(), "a:1");
            assert_eq!(registry.available_count(), 0);
        }
        assert_eq!(registry.available_count(), 1);
    }

    #[tokio::test]
    async fn marked_lease_stays_unresponsive_after_drop() {
        let registry = registry_with(&["a:1"]);
        let lease = registry.lease().await.unwrap();
        lease.mark_unresponsive();
        drop(lease);
        assert_eq!(registry.state_of("a:1"), Some(NodeState::Unresponsive));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_leases_are_mutually_exclusive() {
        let registry = registry_with(&["a:1", "b:1", "c:1", "d:1"]);
        let held = Arc::new(Mutex::new(HashSet::new()));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let held = Arc::clone(&held);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let lease = registry.lease().await.unwrap();
                    {
                        let mut held = held.lock().unwrap();
                        assert!(held.insert(lease.address().to_string()), "node leased twice");
                        peak.fetch_max(held.len(), Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    held.lock().unwrap().remove(lease.address());
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 4);
        assert_eq!(registry.available_count(), 4);
    }

    // -- backoff -----------------------------------------------------------

    #[test]
    fn lease_wait_is_quadratic() {
        let policy = LeasePolicy::default();
        let waits: Vec<u64> = (1..=4).map(|i| policy.wait_for_attempt(i).as_secs()).collect();
        assert_eq!(waits, vec![1, 4, 9, 16]);
        assert_eq!(policy.wait_for_attempt(15), Duration::from_secs(225));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pool_exhausts_after_quadratic_waits() {
        let registry = Arc::new(NodeRegistry::new(LeasePolicy {
            max_attempts: 3,
            unit: Duration::from_secs(1),
        }));
        let start = Instant::now();

        assert_matches!(
            registry.lease().await,
            Err(PoolError::Exhausted { attempts: 3 })
        );
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 4 + 9));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_lease_picks_up_released_node() {
        let registry = registry_with(&["a:1"]);
        let first = registry.lease().await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.lease().await.map(|l| l.address().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(first);

        assert_eq!(waiter.await.unwrap().unwrap(), "a:1");
    }
}
