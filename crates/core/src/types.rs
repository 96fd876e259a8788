//! Jobs, artifacts and parameter assignments.
//!
//! Everything here is immutable once built and cheap to clone across
//! concurrent dispatch tasks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Index of a job within its batch (dataset order).
pub type JobId = usize;

/// One concrete `{node, input, value}` assignment applied to a workflow.
///
/// Serialized with the `node_name` / `input` / `value` keys used by
/// hyperparameter and generation-parameter files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamAssignment {
    /// Title of the workflow node to adjust.
    #[serde(rename = "node_name", alias = "target_name")]
    pub target_name: String,
    /// Name of the node input to overwrite.
    #[serde(rename = "input", alias = "input_name")]
    pub input_name: String,
    pub value: serde_json::Value,
}

impl ParamAssignment {
    pub fn new(
        target_name: impl Into<String>,
        input_name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            input_name: input_name.into(),
            value: value.into(),
        }
    }
}

/// A tunable input together with every candidate value to search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterSpec {
    #[serde(rename = "node_name", alias = "target_name")]
    pub target_name: String,
    #[serde(rename = "input", alias = "input_name")]
    pub input_name: String,
    /// Candidate values, searched in the given order.
    #[serde(rename = "value", alias = "values")]
    pub values: Vec<serde_json::Value>,
}

impl HyperparameterSpec {
    pub fn new(
        target_name: impl Into<String>,
        input_name: impl Into<String>,
        values: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            input_name: input_name.into(),
            values,
        }
    }

    /// Single-value assignment for the candidate at `index`.
    pub fn assignment(&self, index: usize) -> Option<ParamAssignment> {
        self.values.get(index).map(|value| ParamAssignment {
            target_name: self.target_name.clone(),
            input_name: self.input_name.clone(),
            value: value.clone(),
        })
    }
}

/// A named input file bound to the workflow node that loads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputArtifact {
    /// Title of the load node receiving this file, e.g. `Load object Image`.
    pub target_name: String,
    pub path: PathBuf,
}

impl InputArtifact {
    pub fn new(target_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            target_name: target_name.into(),
            path: path.into(),
        }
    }
}

/// One dataset entry: the input files for a single job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub inputs: Vec<InputArtifact>,
}

impl DatasetRecord {
    pub fn new(inputs: Vec<InputArtifact>) -> Self {
        Self { inputs }
    }

    /// Name used to label the job's output: the first input's file name.
    pub fn name(&self) -> Option<String> {
        self.inputs
            .first()
            .and_then(|input| input.path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// One unit of work handed to the dispatcher.
///
/// Reused unchanged across retry attempts; only the target node varies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Traceable label, carried into the produced [`Artifact`].
    pub name: String,
    pub inputs: Vec<InputArtifact>,
    pub params: Vec<ParamAssignment>,
}

impl Job {
    /// Build a job from a dataset record merged with run-level params.
    ///
    /// Falls back to `job-<id>` when the record carries no file name.
    pub fn from_record(id: JobId, record: &DatasetRecord, params: &[ParamAssignment]) -> Self {
        Self {
            id,
            name: record.name().unwrap_or_else(|| format!("job-{id}")),
            inputs: record.inputs.clone(),
            params: params.to_vec(),
        }
    }

    /// Path of the input bound to `target_name`, if any.
    pub fn input_for(&self, target_name: &str) -> Option<&Path> {
        self.inputs
            .iter()
            .find(|input| input.target_name == target_name)
            .map(|input| input.path.as_path())
    }
}

/// The output of one successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Name of the job that produced it.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// Run-level arguments shared by every job in one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArgs {
    /// Dataset name, used to group stored results.
    pub eval_set: String,
    pub run_name: String,
    /// Fixed assignments applied to every job.
    #[serde(default)]
    pub generation_params: Vec<ParamAssignment>,
    /// Free-form arguments recorded alongside the results.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunArgs {
    pub fn new(eval_set: impl Into<String>, run_name: impl Into<String>) -> Self {
        Self {
            eval_set: eval_set.into(),
            run_name: run_name.into(),
            generation_params: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_generation_params(mut self, params: Vec<ParamAssignment>) -> Self {
        self.generation_params = params;
        self
    }

    /// Arguments for grid point `index`.
    ///
    /// The point's assignments are appended after the fixed ones so they
    /// take effect last, and the run is named `hs_<run_name>_<index>`.
    pub fn for_grid_point(&self, index: usize, point: &[ParamAssignment]) -> Self {
        let mut args = self.clone();
        args.generation_params.extend_from_slice(point);
        args.run_name = format!("hs_{}_{}", self.run_name, index);
        args
    }
}
