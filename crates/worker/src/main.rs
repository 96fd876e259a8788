use anyhow::Context;
use pixaris_cluster::config::PoolConfig;
use pixaris_worker::config::WorkerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "pixaris_worker=info,pixaris_pipeline=info,pixaris_cluster=info,pixaris_comfyui=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let pool_config = PoolConfig::from_env().context("invalid pool configuration")?;

    tracing::info!(
        eval_set = %config.eval_set,
        run_name = %config.run_name,
        max_parallel_jobs = config.max_parallel_jobs,
        dev_mode = pool_config.dev_mode,
        "Worker starting",
    );

    let summary = pixaris_worker::run::run(&config, &pool_config).await?;
    tracing::info!(
        batches = summary.batches,
        failed_batches = summary.failed_batches,
        artifacts = summary.artifacts,
        failed_jobs = summary.failed_jobs,
        "Worker finished",
    );
    Ok(())
}
