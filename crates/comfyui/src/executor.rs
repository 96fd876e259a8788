//! [`WorkflowExecutor`] backed by a ComfyUI server.
//!
//! Each job gets its own copy of the template workflow: parameters are
//! applied, inputs are uploaded and wired to their loader nodes, the
//! prompt is queued and polled until it finishes, and the first image of
//! the output node is downloaded as the job's artifact.

use std::time::Duration;

use async_trait::async_trait;
use pixaris_core::executor::{ExecutorError, WorkflowExecutor};
use pixaris_core::retry::{retry, RetryPolicy};
use pixaris_core::types::{Artifact, DatasetRecord, InputArtifact, Job, ParamAssignment};
use sha2::{Digest, Sha256};

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::{parse_history, PromptHistory};
use crate::workflow::{ComfyWorkflow, DEFAULT_LOAD_IMAGE_NODE, LOAD_IMAGE_CLASS};

/// Default node whose first image is the job's output.
pub const DEFAULT_OUTPUT_NODE: &str = "Save Image";

/// Sampler node that receives a per-input deterministic seed.
const SEED_NODE: &str = "KSampler (Efficient) - Generation";

/// Delay between history polls while a prompt runs.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Seeds stay within `1..=SEED_MODULUS` so ComfyUI accepts them.
const SEED_MODULUS: u64 = 1_000_000;

/// Runs a fixed workflow template on whichever node it is given.
pub struct ComfyExecutor {
    template: ComfyWorkflow,
    output_node: String,
    client: reqwest::Client,
    request_policy: RetryPolicy,
    poll_interval: Duration,
}

impl ComfyExecutor {
    /// Executor for `template`, returning the `Save Image` output.
    pub fn new(template: ComfyWorkflow) -> Self {
        Self {
            template,
            output_node: DEFAULT_OUTPUT_NODE.to_string(),
            client: reqwest::Client::new(),
            request_policy: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_output_node(mut self, node_name: impl Into<String>) -> Self {
        self.output_node = node_name.into();
        self
    }

    /// Retry policy for the individual queue and poll requests.
    pub fn with_request_policy(mut self, policy: RetryPolicy) -> Self {
        self.request_policy = policy;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Template copy with `params` applied and plot fan-out removed.
    pub fn prepare(&self, params: &[ParamAssignment]) -> Result<ComfyWorkflow, ExecutorError> {
        let mut workflow = self.template.clone();
        workflow.collapse_xy_plot();
        workflow.apply_assignments(params)?;
        Ok(workflow)
    }

    /// Loader node each input of `inputs` is wired to.
    ///
    /// A workflow with a single `Load Image` loader accepts one input
    /// regardless of the name it is bound to.
    pub fn loader_targets<'a>(
        &self,
        workflow: &ComfyWorkflow,
        inputs: &'a [InputArtifact],
    ) -> Vec<(&'a InputArtifact, String)> {
        let single_loader = inputs.len() == 1
            && workflow.count_class(LOAD_IMAGE_CLASS) == 1
            && workflow.has_node(DEFAULT_LOAD_IMAGE_NODE);

        inputs
            .iter()
            .map(|input| {
                let target = if single_loader {
                    DEFAULT_LOAD_IMAGE_NODE.to_string()
                } else {
                    input.target_name.clone()
                };
                (input, target)
            })
            .collect()
    }

    // ---- private helpers ----

    /// Every input of `job` read into memory with its loader node and
    /// upload file name. Runs before any upload, so a missing local file
    /// fails the job without touching the worker.
    async fn read_inputs(
        &self,
        workflow: &ComfyWorkflow,
        job: &Job,
    ) -> Result<Vec<LoadedInput>, ExecutorError> {
        let mut reads = Vec::with_capacity(job.inputs.len());
        for (input, target) in self.loader_targets(workflow, &job.inputs) {
            let bytes = tokio::fs::read(&input.path).await.map_err(|e| {
                ExecutorError::Io(format!("cannot read {}: {e}", input.path.display()))
            })?;
            let file_name = input
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{}.png", job.name));
            reads.push(LoadedInput {
                target,
                file_name,
                bytes,
            });
        }
        Ok(reads)
    }

    /// Uploads the inputs and returns the job seed, taken from the last
    /// image set.
    async fn upload_inputs(
        &self,
        api: &ComfyUIApi,
        workflow: &mut ComfyWorkflow,
        job: &Job,
    ) -> Result<Option<u64>, ExecutorError> {
        let reads = self.read_inputs(workflow, job).await?;
        let seed = job_seed(&reads);
        for input in reads {
            let upload = api.upload_image(input.bytes, &input.file_name).await?;
            workflow.set_image(&input.target, &upload.image_path())?;
        }
        Ok(seed)
    }

    async fn wait_for_done(
        &self,
        api: &ComfyUIApi,
        prompt_id: &str,
    ) -> Result<PromptHistory, ExecutorError> {
        loop {
            let body = retry(&self.request_policy, ComfyUIApiError::is_transient, || {
                api.get_history(prompt_id)
            })
            .await?;

            let history = parse_history(prompt_id, &body)
                .map_err(|e| ExecutorError::Protocol(format!("unexpected history entry: {e}")))?;

            match history {
                Some(history) if history.is_finished() => return Ok(history),
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

#[async_trait]
impl WorkflowExecutor for ComfyExecutor {
    async fn validate(
        &self,
        dataset: &[DatasetRecord],
        params: &[ParamAssignment],
    ) -> Result<(), ExecutorError> {
        let mut workflow = self.template.clone();
        workflow.collapse_xy_plot();

        for record in dataset {
            for (_, target) in self.loader_targets(&workflow, &record.inputs) {
                if !workflow.has_node(&target) {
                    return Err(ExecutorError::Validation(format!(
                        "Dataset input targets missing node {target}"
                    )));
                }
            }
        }

        if !workflow.has_node(&self.output_node) {
            return Err(ExecutorError::Validation(format!(
                "Output node {} does not exist in the workflow",
                self.output_node
            )));
        }

        for param in params {
            workflow.check_assignment(param).map_err(|e| {
                ExecutorError::Validation(format!(
                    "{e} (can't set {}.{} to {})",
                    param.target_name, param.input_name, param.value
                ))
            })?;
        }
        Ok(())
    }

    async fn execute(&self, address: &str, job: &Job) -> Result<Artifact, ExecutorError> {
        let started = tokio::time::Instant::now();
        let api = ComfyUIApi::for_address(self.client.clone(), address);
        let mut workflow = self.prepare(&job.params)?;

        if let Some(seed) = self.upload_inputs(&api, &mut workflow, job).await? {
            if workflow.has_node(SEED_NODE) {
                workflow.set_value(SEED_NODE, "seed", seed.into())?;
            }
        }

        let prompt = workflow.to_prompt();
        let client_id = uuid::Uuid::new_v4().to_string();
        let submitted = retry(&self.request_policy, ComfyUIApiError::is_transient, || {
            api.submit_workflow(&prompt, &client_id)
        })
        .await?;

        tracing::debug!(
            address,
            job = %job.name,
            prompt_id = %submitted.prompt_id,
            queue_position = submitted.number,
            "Workflow queued",
        );

        let history = self.wait_for_done(&api, &submitted.prompt_id).await?;
        if let Some(message) = history.error_message() {
            return Err(ExecutorError::Remote(message));
        }

        let node_id = workflow
            .node_id_for_name(&self.output_node)
            .ok_or_else(|| {
                ExecutorError::Validation(format!("Output node {} is missing", self.output_node))
            })?;
        let image = history.first_image(node_id).ok_or_else(|| {
            ExecutorError::Protocol(format!("Node {} produced no image", self.output_node))
        })?;
        let bytes = api.view_image(image).await?;

        tracing::info!(
            address,
            job = %job.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Workflow executed",
        );

        Ok(Artifact::new(job.name.clone(), bytes))
    }
}

/// One job input loaded from disk, ready for upload.
struct LoadedInput {
    target: String,
    file_name: String,
    bytes: Vec<u8>,
}

fn job_seed(inputs: &[LoadedInput]) -> Option<u64> {
    inputs.last().map(|input| seed_for(&input.bytes))
}

/// Deterministic seed for an input image.
///
/// The same image always gets the same seed so runs stay comparable,
/// while different images get different seeds.
pub fn seed_for(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % SEED_MODULUS + 1
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn executor() -> ComfyExecutor {
        let template = ComfyWorkflow::from_value(json!({
            "1": {"class_type": "LoadImage", "inputs": {"image": "x.png"}, "_meta": {"title": "Load object Image"}},
            "2": {"class_type": "LoadImage", "inputs": {"image": "y.png"}, "_meta": {"title": "Load mask Image"}},
            "3": {"class_type": "KSampler", "inputs": {"steps": 20, "denoise": 1.0}, "_meta": {"title": "KSampler"}},
            "9": {"class_type": "SaveImage", "inputs": {"images": ["3", 0]}, "_meta": {"title": "Save Image"}}
        }))
        .unwrap();
        ComfyExecutor::new(template)
    }

    fn record(targets: &[&str]) -> DatasetRecord {
        DatasetRecord::new(
            targets
                .iter()
                .map(|t| InputArtifact::new(*t, format!("/data/{t}/img01.png")))
                .collect(),
        )
    }

    #[test]
    fn seed_is_deterministic_and_bounded() {
        let a = seed_for(b"image-a");
        assert_eq!(a, seed_for(b"image-a"));
        assert_ne!(a, seed_for(b"image-b"));
        assert!((1..=SEED_MODULUS).contains(&a));
    }

    #[tokio::test]
    async fn validate_accepts_matching_dataset_and_params() {
        let exec = executor();
        let dataset = vec![record(&["Load object Image", "Load mask Image"])];
        let params = vec![
            ParamAssignment::new("KSampler", "steps", 30),
            ParamAssignment::new("KSampler", "denoise", 0.5),
        ];
        assert!(exec.validate(&dataset, &params).await.is_ok());
    }

    #[tokio::test]
    async fn validate_rejects_unknown_input_node() {
        let exec = executor();
        let dataset = vec![record(&["Load object Image", "Load depth Image"])];
        assert_matches!(
            exec.validate(&dataset, &[]).await,
            Err(ExecutorError::Validation(msg)) if msg.contains("Load depth Image")
        );
    }

    #[tokio::test]
    async fn validate_rejects_bad_param_type() {
        let exec = executor();
        let params = vec![ParamAssignment::new("KSampler", "steps", "many")];
        assert_matches!(
            exec.validate(&[], &params).await,
            Err(ExecutorError::Validation(msg)) if msg.contains("KSampler.steps")
        );
    }

    #[tokio::test]
    async fn validate_rejects_missing_output_node() {
        let exec = executor().with_output_node("Upscaled");
        assert!(exec.validate(&[], &[]).await.is_err());
    }

    #[test]
    fn single_loader_workflow_takes_any_input_name() {
        let template = ComfyWorkflow::from_value(json!({
            "1": {"class_type": "LoadImage", "inputs": {"image": "x.png"}, "_meta": {"title": "Load Image"}},
            "9": {"class_type": "SaveImage", "inputs": {}, "_meta": {"title": "Save Image"}}
        }))
        .unwrap();
        let exec = ComfyExecutor::new(template.clone());
        let inputs = vec![InputArtifact::new("Load input Image", "/data/a.png")];

        let targets = exec.loader_targets(&template, &inputs);
        assert_eq!(targets[0].1, DEFAULT_LOAD_IMAGE_NODE);
    }

    #[test]
    fn prepare_applies_params_to_a_copy() {
        let exec = executor();
        let wf = exec
            .prepare(&[ParamAssignment::new("KSampler", "steps", 8)])
            .unwrap();
        assert_eq!(wf.get_value("KSampler", "steps"), Some(&json!(8)));
        assert_eq!(exec.template.get_value("KSampler", "steps"), Some(&json!(20)));
    }

    #[tokio::test]
    async fn execute_fails_on_unreachable_node_as_node_failure() {
        let exec = executor().with_request_policy(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img01.png");
        std::fs::write(&path, b"png").unwrap();
        let job = Job::from_record(
            0,
            &DatasetRecord::new(vec![
                InputArtifact::new("Load object Image", &path),
                InputArtifact::new("Load mask Image", &path),
            ]),
            &[],
        );

        // Port 9 (discard) on loopback is not serving HTTP.
        let err = exec.execute("127.0.0.1:9", &job).await.unwrap_err();
        assert!(err.is_node_failure(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn missing_input_fails_locally_before_contacting_the_node() {
        let exec = executor().with_request_policy(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });
        let job = Job::from_record(
            0,
            &DatasetRecord::new(vec![InputArtifact::new(
                "Load Image",
                "/no/such/input.png",
            )]),
            &[],
        );

        let err = exec.execute("127.0.0.1:9", &job).await.unwrap_err();
        assert_matches!(&err, ExecutorError::Io(msg) if msg.contains("/no/such/input.png"));
        assert!(!err.is_node_failure());
    }

    #[tokio::test]
    async fn seed_follows_the_last_input_image() {
        let exec = executor();
        let dir = tempfile::tempdir().unwrap();
        let object = dir.path().join("object.png");
        let mask = dir.path().join("mask.png");
        std::fs::write(&object, b"object-pixels").unwrap();
        std::fs::write(&mask, b"mask-pixels").unwrap();
        let job = Job::from_record(
            0,
            &DatasetRecord::new(vec![
                InputArtifact::new("Load object Image", &object),
                InputArtifact::new("Load mask Image", &mask),
            ]),
            &[],
        );

        let reads = exec.read_inputs(&exec.template, &job).await.unwrap();
        assert_eq!(reads[0].target, "Load object Image");
        assert_eq!(reads[1].file_name, "mask.png");
        assert_eq!(job_seed(&reads), Some(seed_for(b"mask-pixels")));
        assert_eq!(job_seed(&[]), None);
    }
}
