//! Wires the pool, executor, dataset and sink together and runs either
//! a plain evaluation or a grid search.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use pixaris_cluster::config::PoolConfig;
use pixaris_cluster::discovery::LocalDiscovery;
use pixaris_cluster::pool::WorkerPool;
use pixaris_cluster::probe::Probe;
use pixaris_comfyui::executor::ComfyExecutor;
use pixaris_comfyui::mock::MockExecutor;
use pixaris_comfyui::workflow::ComfyWorkflow;
use pixaris_core::executor::WorkflowExecutor;
use pixaris_pipeline::dataset::LocalDatasetSource;
use pixaris_pipeline::dispatcher::JobDispatcher;
use pixaris_pipeline::orchestrator::{BatchOrchestrator, GridPointResult};
use pixaris_pipeline::sink::LocalResultSink;

use crate::config::WorkerConfig;

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Batches that completed (one for a plain run).
    pub batches: usize,
    /// Batches that ended in error.
    pub failed_batches: usize,
    pub artifacts: usize,
    pub failed_jobs: usize,
}

/// Mock runs need no reachable worker.
struct AssumeAlive;

#[async_trait]
impl Probe for AssumeAlive {
    async fn is_alive(&self, _address: &str) -> bool {
        true
    }
}

/// Build the pool: in-process slots for the mock executor, otherwise
/// the configured discovery.
async fn build_pool(config: &WorkerConfig, pool_config: &PoolConfig) -> anyhow::Result<WorkerPool> {
    if !config.mock_executor {
        return WorkerPool::from_config(pool_config)
            .await
            .context("cannot start worker pool");
    }

    let slots = (0..config.max_parallel_jobs)
        .map(|i| format!("mock-{i}"))
        .collect();
    let pool = WorkerPool::new(
        Arc::new(pool_config.registry()),
        Arc::new(LocalDiscovery::new(slots)),
        Arc::new(AssumeAlive),
    );
    pool.start(pool_config.discovery_interval).await;
    Ok(pool)
}

fn build_executor(config: &WorkerConfig) -> anyhow::Result<Arc<dyn WorkflowExecutor>> {
    if config.mock_executor {
        tracing::info!("Using mock executor");
        return Ok(Arc::new(MockExecutor::new()));
    }
    let path = config
        .workflow_path
        .as_deref()
        .context("WORKFLOW_PATH must be set")?;
    let workflow = ComfyWorkflow::load(path)?;
    Ok(Arc::new(
        ComfyExecutor::new(workflow).with_output_node(config.output_node_name.clone()),
    ))
}

/// Run the configured evaluation to completion and close the pool.
///
/// A plain run fails when its batch fails. A grid search fails only
/// when validation fails or every grid point failed.
pub async fn run(config: &WorkerConfig, pool_config: &PoolConfig) -> anyhow::Result<RunSummary> {
    let executor = build_executor(config)?;
    let args = config.run_args()?;
    let specs = config.hyperparameters()?;

    let pool = build_pool(config, pool_config).await?;
    let dispatcher = Arc::new(JobDispatcher::new(Arc::clone(pool.registry()), executor));
    let orchestrator = BatchOrchestrator::new(
        dispatcher,
        Arc::new(LocalDatasetSource::new(&config.eval_dir, &config.eval_set)),
        Arc::new(LocalResultSink::new(&config.results_dir)),
    )
    .with_max_parallel_jobs(config.max_parallel_jobs);

    let result = match specs {
        Some(specs) => orchestrator
            .run_grid_search(&args, &specs)
            .await
            .map_err(anyhow::Error::from)
            .and_then(summarize_grid),
        None => orchestrator
            .run_evaluation(&args)
            .await
            .map(|report| RunSummary {
                batches: 1,
                failed_batches: 0,
                artifacts: report.artifacts.len(),
                failed_jobs: report.failure_count(),
            })
            .map_err(anyhow::Error::from),
    };

    pool.close().await;
    result
}

fn summarize_grid(results: Vec<GridPointResult>) -> anyhow::Result<RunSummary> {
    let mut summary = RunSummary {
        batches: results.len(),
        failed_batches: 0,
        artifacts: 0,
        failed_jobs: 0,
    };
    for point in &results {
        match &point.result {
            Ok(report) => {
                summary.artifacts += report.artifacts.len();
                summary.failed_jobs += report.failure_count();
            }
            Err(_) => summary.failed_batches += 1,
        }
    }

    if summary.batches > 0 && summary.failed_batches == summary.batches {
        anyhow::bail!("all {} grid points failed", summary.batches);
    }
    Ok(summary)
}
