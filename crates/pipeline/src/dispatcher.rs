//! Single-job dispatch with retries across worker nodes.
//!
//! Each attempt leases a node, runs the executor on it and releases the
//! node when the lease guard drops. A failed attempt marks the node
//! unresponsive and the next attempt runs on a freshly leased node.
//! [`JobDispatcher::dispatch`] never fails: every job ends as an
//! [`ExecutionOutcome`].

use std::sync::Arc;
use std::time::Duration;

use pixaris_cluster::error::PoolError;
use pixaris_cluster::registry::NodeRegistry;
use pixaris_core::executor::{ExecutorError, WorkflowExecutor};
use pixaris_core::sink::FailureRecord;
use pixaris_core::types::{Artifact, Job, JobId};

/// Default number of attempts per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Attempt budget and the wait between failed attempts.
///
/// After failed attempt `k` (0-indexed) the dispatcher waits
/// `(k + 1)² * unit` before the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            unit: Duration::from_secs(1),
        }
    }
}

impl DispatchPolicy {
    pub fn wait_after(&self, attempt: u32) -> Duration {
        let n = attempt.saturating_add(1);
        self.unit.saturating_mul(n.saturating_mul(n))
    }
}

/// Why a job ended in failure.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The last attempt failed on its node.
    #[error(transparent)]
    Execution(#[from] ExecutorError),

    /// No node could be leased for an attempt.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result of dispatching one job.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Success { job_id: JobId, artifact: Artifact },
    Failure { job: Job, error: DispatchError },
}

impl ExecutionOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Success { job_id, .. } => *job_id,
            Self::Failure { job, .. } => job.id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Failure summary for reporting, `None` on success.
    pub fn failure_record(&self) -> Option<FailureRecord> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { job, error } => Some(FailureRecord {
                job_id: job.id,
                job_name: job.name.clone(),
                error: error.to_string(),
            }),
        }
    }
}

/// Runs jobs on leased nodes.
pub struct JobDispatcher {
    registry: Arc<NodeRegistry>,
    executor: Arc<dyn WorkflowExecutor>,
    policy: DispatchPolicy,
}

impl JobDispatcher {
    pub fn new(registry: Arc<NodeRegistry>, executor: Arc<dyn WorkflowExecutor>) -> Self {
        Self {
            registry,
            executor,
            policy: DispatchPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn executor(&self) -> &Arc<dyn WorkflowExecutor> {
        &self.executor
    }

    /// Run `job`, retrying on other nodes up to the attempt budget.
    ///
    /// A lease that cannot be obtained ends the job at once. Validation
    /// and local I/O errors from the executor are not retried and do not
    /// mark the node; no other node would do better.
    pub async fn dispatch(&self, job: Job) -> ExecutionOutcome {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let lease = match self.registry.lease().await {
                Ok(lease) => lease,
                Err(e) => {
                    tracing::error!(job = %job.name, error = %e, "Could not lease a node");
                    return ExecutionOutcome::Failure {
                        job,
                        error: e.into(),
                    };
                }
            };

            let error = match self.executor.execute(lease.address(), &job).await {
                Ok(artifact) => {
                    return ExecutionOutcome::Success {
                        job_id: job.id,
                        artifact,
                    };
                }
                Err(e) if !e.is_node_failure() => {
                    tracing::warn!(job = %job.name, error = %e, "Job rejected by executor");
                    return ExecutionOutcome::Failure {
                        job,
                        error: e.into(),
                    };
                }
                Err(e) => e,
            };

            tracing::warn!(
                address = lease.address(),
                job = %job.name,
                attempt = attempt + 1,
                max_attempts = attempts,
                error = %error,
                "Job attempt failed, marking node unresponsive",
            );
            lease.mark_unresponsive();
            drop(lease);

            attempt += 1;
            if attempt >= attempts {
                return ExecutionOutcome::Failure {
                    job,
                    error: error.into(),
                };
            }
            tokio::time::sleep(self.policy.wait_after(attempt - 1)).await;
        }
    }
}
