use std::path::{Path, PathBuf};

use pixaris_comfyui::executor::DEFAULT_OUTPUT_NODE;
use pixaris_core::types::{HyperparameterSpec, ParamAssignment, RunArgs};
use serde_json::Value;

/// Errors raised while reading worker configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("cannot read {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub eval_dir: PathBuf,
    pub eval_set: String,
    /// ComfyUI API-format workflow. Optional only with the mock executor.
    pub workflow_path: Option<PathBuf>,
    pub run_name: String,
    /// JSON list of hyperparameter specs; set → grid search.
    pub hyperparameters_file: Option<PathBuf>,
    /// JSON list of fixed assignments applied to every job.
    pub generation_params_file: Option<PathBuf>,
    pub results_dir: PathBuf,
    pub max_parallel_jobs: usize,
    pub output_node_name: String,
    pub mock_executor: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default         |
    /// |--------------------------|-----------------|
    /// | `EVAL_DIR`               | `eval_data`     |
    /// | `EVAL_SET`               | required        |
    /// | `WORKFLOW_PATH`          | required*       |
    /// | `RUN_NAME`               | required        |
    /// | `HYPERPARAMETERS_FILE`   | unset           |
    /// | `GENERATION_PARAMS_FILE` | unset           |
    /// | `RESULTS_DIR`            | `local_results` |
    /// | `MAX_PARALLEL_JOBS`      | `1`             |
    /// | `OUTPUT_NODE_NAME`       | `Save Image`    |
    /// | `MOCK_EXECUTOR`          | `false`         |
    ///
    /// \* not needed when `MOCK_EXECUTOR=true`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with a custom variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let mock_executor = get("MOCK_EXECUTOR")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let workflow_path = get("WORKFLOW_PATH").map(PathBuf::from);
        if workflow_path.is_none() && !mock_executor {
            return Err(ConfigError::Missing("WORKFLOW_PATH"));
        }

        let max_parallel_jobs = match get("MAX_PARALLEL_JOBS") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                Ok(_) => {
                    return Err(ConfigError::Invalid {
                        name: "MAX_PARALLEL_JOBS",
                        reason: "must be at least 1".into(),
                    })
                }
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        name: "MAX_PARALLEL_JOBS",
                        reason: e.to_string(),
                    })
                }
            },
            None => 1,
        };

        Ok(Self {
            eval_dir: get("EVAL_DIR").unwrap_or_else(|| "eval_data".into()).into(),
            eval_set: required("EVAL_SET")?,
            workflow_path,
            run_name: required("RUN_NAME")?,
            hyperparameters_file: get("HYPERPARAMETERS_FILE").map(PathBuf::from),
            generation_params_file: get("GENERATION_PARAMS_FILE").map(PathBuf::from),
            results_dir: get("RESULTS_DIR")
                .unwrap_or_else(|| "local_results".into())
                .into(),
            max_parallel_jobs,
            output_node_name: get("OUTPUT_NODE_NAME")
                .unwrap_or_else(|| DEFAULT_OUTPUT_NODE.to_string()),
            mock_executor,
        })
    }

    /// Run-level arguments: names plus the fixed generation params.
    pub fn run_args(&self) -> Result<RunArgs, ConfigError> {
        let params = match &self.generation_params_file {
            Some(path) => read_json_list::<ParamAssignment>(path)?,
            None => Vec::new(),
        };
        let mut args =
            RunArgs::new(self.eval_set.clone(), self.run_name.clone()).with_generation_params(params);
        if let Some(path) = &self.workflow_path {
            args.extra.insert(
                "workflow".into(),
                Value::String(path.display().to_string()),
            );
        }
        args.extra
            .insert("max_parallel_jobs".into(), self.max_parallel_jobs.into());
        Ok(args)
    }

    /// Hyperparameter specs, when a grid search was requested.
    pub fn hyperparameters(&self) -> Result<Option<Vec<HyperparameterSpec>>, ConfigError> {
        self.hyperparameters_file
            .as_deref()
            .map(read_json_list)
            .transpose()
    }
}

fn read_json_list<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, ConfigError> {
    let file_error = |reason: String| ConfigError::File {
        path: path.to_path_buf(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| file_error(e.to_string()))
}
