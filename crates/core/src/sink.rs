//! Contract for persisting a finished batch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Artifact, JobId, RunArgs};

/// One failed job, as recorded alongside a batch's results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_id: JobId,
    pub job_name: String,
    pub error: String,
}

/// Persists the outputs of one batch run.
///
/// A storage failure is reported to the caller and never retried.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(
        &self,
        args: &RunArgs,
        artifacts: &[Artifact],
        failures: &[FailureRecord],
    ) -> Result<(), CoreError>;
}
