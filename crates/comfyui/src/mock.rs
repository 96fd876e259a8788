//! Executor that echoes its first input, for dry runs without a cluster.

use async_trait::async_trait;
use pixaris_core::executor::{ExecutorError, WorkflowExecutor};
use pixaris_core::types::{Artifact, DatasetRecord, Job, ParamAssignment};

/// Returns the first input file of each job unchanged.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor;

impl MockExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkflowExecutor for MockExecutor {
    async fn validate(
        &self,
        _dataset: &[DatasetRecord],
        _params: &[ParamAssignment],
    ) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn execute(&self, address: &str, job: &Job) -> Result<Artifact, ExecutorError> {
        let input = job.inputs.first().ok_or_else(|| {
            ExecutorError::Validation(format!("Job {} has no inputs", job.name))
        })?;
        let bytes = tokio::fs::read(&input.path).await?;
        tracing::debug!(address, job = %job.name, "Mock execution");
        Ok(Artifact::new(job.name.clone(), bytes))
    }
}
