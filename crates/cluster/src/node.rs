//! Worker node state.

use std::fmt;

/// Lifecycle state of a worker node.
///
/// `Available <-> Leased` through lease and release. Any state moves to
/// `Unresponsive` after a failed execution, and only a later discovery
/// cycle moves it back to `Available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Available,
    Leased,
    Unresponsive,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Available => "available",
            Self::Leased => "leased",
            Self::Unresponsive => "unresponsive",
        };
        f.write_str(s)
    }
}

/// One reachable execution endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerNode {
    /// `host:port` the executor connects to.
    pub address: String,
    pub state: NodeState,
    /// How many times the node has been marked unresponsive.
    pub failures: u32,
    /// Discovery cycle that last confirmed the node reachable.
    pub last_seen_cycle: u64,
}

impl WorkerNode {
    pub(crate) fn discovered(address: String, cycle: u64) -> Self {
        Self {
            address,
            state: NodeState::Available,
            failures: 0,
            last_seen_cycle: cycle,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == NodeState::Available
    }
}
