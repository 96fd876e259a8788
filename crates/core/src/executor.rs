//! Contract for running one job's workflow on a worker node.

use async_trait::async_trait;

use crate::types::{Artifact, DatasetRecord, Job, ParamAssignment};

/// Executes workflows against a remote worker.
///
/// `execute` is a single call per attempt; the caller owns retrying on
/// another node.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Check the dataset shape and every single-value assignment before
    /// any job runs.
    async fn validate(
        &self,
        dataset: &[DatasetRecord],
        params: &[ParamAssignment],
    ) -> Result<(), ExecutorError>;

    /// Run `job` on the worker reachable at `address`.
    async fn execute(&self, address: &str, job: &Job) -> Result<Artifact, ExecutorError>;
}

/// Errors an executor may report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// Input or parameters rejected; retrying elsewhere cannot help.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The worker could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The worker accepted the job but reported a failure.
    #[error("Remote execution failed: {0}")]
    Remote(String),

    /// Reading inputs or writing outputs locally failed. The node was
    /// never involved.
    #[error("I/O error: {0}")]
    Io(String),

    /// The worker answered with something unexpected.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ExecutorError {
    /// Whether the failure is attributable to the node that ran the job.
    pub fn is_node_failure(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::Io(_))
    }
}

impl From<std::io::Error> for ExecutorError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
