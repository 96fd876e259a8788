//! Result sink writing each run to a timestamped local directory.
//!
//! ```text
//! <results>/<eval_set>/<run_name>_<YYYYmmdd-HHMMSS>/
//!     <stem>.png      one per artifact
//!     args.json       the run arguments
//!     failures.json   failed jobs
//! <results>/all_experiment_results.jsonl   one summary line per run
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pixaris_core::error::CoreError;
use pixaris_core::sink::{FailureRecord, ResultSink};
use pixaris_core::types::{Artifact, RunArgs};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

/// Name of the run index file under the results root.
pub const GLOBAL_TRACKING_FILE: &str = "all_experiment_results.jsonl";

#[derive(Debug, Clone)]
pub struct LocalResultSink {
    root: PathBuf,
}

/// One line of the run index.
#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    timestamp: &'a str,
    eval_set: &'a str,
    run_name: &'a str,
    succeeded: usize,
    failed: usize,
    output_dir: String,
}

impl LocalResultSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// File name for an artifact: its name up to the first dot, as PNG.
pub fn artifact_file_name(name: &str) -> String {
    let stem = name.split('.').next().unwrap_or(name);
    format!("{stem}.png")
}

#[async_trait]
impl ResultSink for LocalResultSink {
    async fn store(
        &self,
        args: &RunArgs,
        artifacts: &[Artifact],
        failures: &[FailureRecord],
    ) -> Result<(), CoreError> {
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let run_dir = self
            .root
            .join(&args.eval_set)
            .join(format!("{}_{timestamp}", args.run_name));
        tokio::fs::create_dir_all(&run_dir).await?;

        for artifact in artifacts {
            tokio::fs::write(run_dir.join(artifact_file_name(&artifact.name)), &artifact.bytes)
                .await?;
        }

        write_json(&run_dir.join("args.json"), args).await?;
        write_json(&run_dir.join("failures.json"), failures).await?;

        let summary = RunSummary {
            timestamp: &timestamp,
            eval_set: &args.eval_set,
            run_name: &args.run_name,
            succeeded: artifacts.len(),
            failed: failures.len(),
            output_dir: run_dir.display().to_string(),
        };
        let mut line = serde_json::to_string(&summary).map_err(internal)?;
        line.push('\n');

        let mut index = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(GLOBAL_TRACKING_FILE))
            .await?;
        index.write_all(line.as_bytes()).await?;
        index.flush().await?;

        tracing::debug!(dir = %run_dir.display(), "Run written");
        Ok(())
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), CoreError> {
    let text = serde_json::to_string_pretty(value).map_err(internal)?;
    tokio::fs::write(path, text).await?;
    Ok(())
}

fn internal(e: serde_json::Error) -> CoreError {
    CoreError::Internal(format!("cannot serialize run data: {e}"))
}
