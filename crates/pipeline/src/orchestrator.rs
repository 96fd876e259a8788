//! Batch and grid-search runs.
//!
//! A batch dispatches every job of a dataset with bounded concurrency.
//! It is fatal only when every job failed; partial failure is logged and
//! reported alongside the successes. A grid search validates every
//! candidate value up front, then runs one batch per grid point. Points
//! are independent: a point that fails does not stop the rest.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use pixaris_core::dataset::DatasetSource;
use pixaris_core::hyperparameters::{expand, grid, validate_specs};
use pixaris_core::sink::{FailureRecord, ResultSink};
use pixaris_core::types::{Artifact, DatasetRecord, HyperparameterSpec, Job, ParamAssignment, RunArgs};

use crate::dispatcher::{ExecutionOutcome, JobDispatcher};
use crate::error::PipelineError;

/// Successes and failures of one batch, ordered by job id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub artifacts: Vec<Artifact>,
    pub failures: Vec<FailureRecord>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.artifacts.len() + self.failures.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}

/// Result of one grid point.
#[derive(Debug)]
pub struct GridPointResult {
    pub index: usize,
    /// Arguments the point ran with, including its run name.
    pub args: RunArgs,
    pub result: Result<BatchReport, PipelineError>,
}

/// Drives datasets through the dispatcher and stores the results.
pub struct BatchOrchestrator {
    dispatcher: Arc<JobDispatcher>,
    dataset: Arc<dyn DatasetSource>,
    sink: Arc<dyn ResultSink>,
    max_parallel_jobs: usize,
}

impl BatchOrchestrator {
    pub fn new(
        dispatcher: Arc<JobDispatcher>,
        dataset: Arc<dyn DatasetSource>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            dispatcher,
            dataset,
            sink,
            max_parallel_jobs: 1,
        }
    }

    /// Dispatch up to `n` jobs at once. Values below 1 count as 1.
    pub fn with_max_parallel_jobs(mut self, n: usize) -> Self {
        self.max_parallel_jobs = n.max(1);
        self
    }

    /// Run every job and collect the outcomes.
    ///
    /// Fails with [`PipelineError::AllJobsFailed`] when no job succeeded,
    /// carrying the error of the job that finished last.
    pub async fn run_batch(&self, jobs: Vec<Job>) -> Result<BatchReport, PipelineError> {
        let total = jobs.len();
        if total == 0 {
            tracing::warn!("Batch has no jobs");
            return Ok(BatchReport::default());
        }

        let dispatcher = &self.dispatcher;
        let mut outcomes: Vec<ExecutionOutcome> = stream::iter(jobs)
            .map(|job| dispatcher.dispatch(job))
            .buffer_unordered(self.max_parallel_jobs)
            .collect()
            .await;

        let last_failure = outcomes
            .iter()
            .rev()
            .find_map(ExecutionOutcome::failure_record);

        outcomes.sort_by_key(ExecutionOutcome::job_id);
        let mut report = BatchReport::default();
        for outcome in outcomes {
            match outcome {
                ExecutionOutcome::Success { artifact, .. } => report.artifacts.push(artifact),
                ExecutionOutcome::Failure { job, error } => report.failures.push(FailureRecord {
                    job_id: job.id,
                    job_name: job.name,
                    error: error.to_string(),
                }),
            }
        }

        if report.artifacts.is_empty() {
            let last_error = last_failure
                .map(|record| record.error)
                .unwrap_or_default();
            return Err(PipelineError::AllJobsFailed { total, last_error });
        }

        if !report.failures.is_empty() {
            tracing::warn!(
                failed = report.failure_count(),
                total,
                "Batch finished with failed jobs",
            );
            for failure in &report.failures {
                tracing::warn!(job = %failure.job_name, error = %failure.error, "Job failed");
            }
        }

        Ok(report)
    }

    /// Run the dataset once with the fixed parameters of `args`.
    pub async fn run_evaluation(&self, args: &RunArgs) -> Result<BatchReport, PipelineError> {
        let dataset = self.load_dataset().await?;
        self.validate(&dataset, &args.generation_params).await?;

        tracing::info!(run_name = %args.run_name, jobs = dataset.len(), "Starting evaluation");
        let report = self.run_batch(build_jobs(&dataset, &args.generation_params)).await?;
        self.store(args, &report).await?;
        Ok(report)
    }

    /// Run the dataset once per point of the grid spanned by `specs`.
    ///
    /// Every single candidate value is validated against the executor
    /// before any job runs; an invalid value fails the whole search.
    /// Otherwise one result per grid point is returned in grid order.
    pub async fn run_grid_search(
        &self,
        base: &RunArgs,
        specs: &[HyperparameterSpec],
    ) -> Result<Vec<GridPointResult>, PipelineError> {
        validate_specs(specs).map_err(|e| PipelineError::Validation(e.to_string()))?;
        let dataset = self.load_dataset().await?;

        let mut candidates = base.generation_params.clone();
        candidates.extend(expand(specs));
        self.validate(&dataset, &candidates).await?;

        let points = grid(specs);
        let count = points.len();
        let mut results = Vec::with_capacity(count);

        for (index, point) in points.iter().enumerate() {
            let args = base.for_grid_point(index, point);
            tracing::info!(
                run_name = %args.run_name,
                "Running grid point {} of {count}",
                index + 1,
            );

            let result = match self
                .run_batch(build_jobs(&dataset, &args.generation_params))
                .await
            {
                Ok(report) => self.store(&args, &report).await.map(|()| report),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                tracing::error!(run_name = %args.run_name, error = %e, "Grid point failed");
            }

            results.push(GridPointResult {
                index,
                args,
                result,
            });
        }

        Ok(results)
    }

    // ---- private helpers ----

    async fn load_dataset(&self) -> Result<Vec<DatasetRecord>, PipelineError> {
        self.dataset
            .load_dataset()
            .await
            .map_err(|e| PipelineError::Dataset(e.to_string()))
    }

    async fn validate(
        &self,
        dataset: &[DatasetRecord],
        params: &[ParamAssignment],
    ) -> Result<(), PipelineError> {
        self.dispatcher
            .executor()
            .validate(dataset, params)
            .await
            .map_err(|e| PipelineError::Validation(e.to_string()))
    }

    async fn store(&self, args: &RunArgs, report: &BatchReport) -> Result<(), PipelineError> {
        self.sink
            .store(args, &report.artifacts, &report.failures)
            .await
            .map_err(|e| PipelineError::Sink(e.to_string()))?;
        tracing::info!(
            run_name = %args.run_name,
            artifacts = report.artifacts.len(),
            failures = report.failure_count(),
            "Results stored",
        );
        Ok(())
    }
}

/// One job per dataset record, in dataset order.
pub fn build_jobs(dataset: &[DatasetRecord], params: &[ParamAssignment]) -> Vec<Job> {
    dataset
        .iter()
        .enumerate()
        .map(|(id, record)| Job::from_record(id, record, params))
        .collect()
}
