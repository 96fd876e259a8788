use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use pixaris_cluster::node::NodeState;
use pixaris_cluster::registry::{LeasePolicy, NodeRegistry};
use pixaris_core::dataset::DatasetSource;
use pixaris_core::error::CoreError;
use pixaris_core::executor::{ExecutorError, WorkflowExecutor};
use pixaris_core::sink::{FailureRecord, ResultSink};
use pixaris_core::types::{
    Artifact, DatasetRecord, HyperparameterSpec, InputArtifact, Job, ParamAssignment, RunArgs,
};
use pixaris_pipeline::dispatcher::{ExecutionOutcome, JobDispatcher};
use pixaris_pipeline::error::PipelineError;
use pixaris_pipeline::orchestrator::{build_jobs, BatchOrchestrator};
use serde_json::{json, Value};

// -- fakes -----------------------------------------------------------------

type Rule = Box<dyn Fn(usize, &Job) -> Result<(), ExecutorError> + Send + Sync>;

/// Executor driven by a rule over (call number, job). Records every call.
struct FakeExecutor {
    rule: Rule,
    reject_value: Option<Value>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, Vec<ParamAssignment>)>>,
}

impl FakeExecutor {
    fn new(rule: impl Fn(usize, &Job) -> Result<(), ExecutorError> + Send + Sync + 'static) -> Self {
        Self {
            rule: Box::new(rule),
            reject_value: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn rejecting(mut self, value: Value) -> Self {
        self.reject_value = Some(value);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowExecutor for FakeExecutor {
    async fn validate(
        &self,
        _dataset: &[DatasetRecord],
        params: &[ParamAssignment],
    ) -> Result<(), ExecutorError> {
        match &self.reject_value {
            Some(bad) if params.iter().any(|p| &p.value == bad) => {
                Err(ExecutorError::Validation(format!("value {bad} not accepted")))
            }
            _ => Ok(()),
        }
    }

    async fn execute(&self, address: &str, job: &Job) -> Result<Artifact, ExecutorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((address.to_string(), job.params.clone()));
        (self.rule)(call, job)?;
        Ok(Artifact::new(job.name.clone(), address.as_bytes().to_vec()))
    }
}

struct StaticDataset(Vec<DatasetRecord>);

#[async_trait]
impl DatasetSource for StaticDataset {
    async fn load_dataset(&self) -> Result<Vec<DatasetRecord>, CoreError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct MemorySink {
    fail: bool,
    runs: Mutex<Vec<(RunArgs, usize, Vec<FailureRecord>)>>,
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn store(
        &self,
        args: &RunArgs,
        artifacts: &[Artifact],
        failures: &[FailureRecord],
    ) -> Result<(), CoreError> {
        if self.fail {
            return Err(CoreError::Io("disk full".into()));
        }
        self.runs
            .lock()
            .unwrap()
            .push((args.clone(), artifacts.len(), failures.to_vec()));
        Ok(())
    }
}

// -- helpers ---------------------------------------------------------------

fn registry(nodes: usize) -> Arc<NodeRegistry> {
    let registry = Arc::new(NodeRegistry::new(LeasePolicy {
        max_attempts: 3,
        unit: Duration::from_secs(1),
    }));
    let addresses: Vec<String> = (1..=nodes).map(|n| format!("10.0.0.{n}:8188")).collect();
    registry.apply_discovery(&addresses);
    registry
}

fn dataset(n: usize) -> Vec<DatasetRecord> {
    (1..=n)
        .map(|i| {
            DatasetRecord::new(vec![InputArtifact::new(
                "Load Image",
                format!("eval/set/input/img{i:02}.png"),
            )])
        })
        .collect()
}

struct Harness {
    registry: Arc<NodeRegistry>,
    executor: Arc<FakeExecutor>,
    sink: Arc<MemorySink>,
    orchestrator: BatchOrchestrator,
}

fn harness(nodes: usize, records: usize, executor: FakeExecutor, sink: MemorySink) -> Harness {
    let registry = registry(nodes);
    let executor = Arc::new(executor);
    let sink = Arc::new(sink);
    let dispatcher = Arc::new(JobDispatcher::new(Arc::clone(&registry), executor.clone()));
    let orchestrator = BatchOrchestrator::new(
        dispatcher,
        Arc::new(StaticDataset(dataset(records))),
        sink.clone(),
    );
    Harness {
        registry,
        executor,
        sink,
        orchestrator,
    }
}

fn remote(msg: &str) -> ExecutorError {
    ExecutorError::Remote(msg.to_string())
}

// -- batch -----------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn partial_failure_returns_successes_and_failure_count() {
    let h = harness(
        9,
        3,
        FakeExecutor::new(|_, job| if job.id == 1 { Ok(()) } else { Err(remote("oom")) }),
        MemorySink::default(),
    );

    let report = h
        .orchestrator
        .run_batch(build_jobs(&dataset(3), &[]))
        .await
        .unwrap();

    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.artifacts[0].name, "img02.png");
    assert_eq!(report.failure_count(), 2);
    let failed: Vec<usize> = report.failures.iter().map(|f| f.job_id).collect();
    assert_eq!(failed, vec![0, 2]);
    assert!(report.failures.iter().all(|f| f.error.contains("oom")));
    // Each failed job burned three nodes.
    assert_eq!(h.registry.available_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn all_jobs_failing_is_fatal_with_last_error() {
    let h = harness(
        9,
        3,
        FakeExecutor::new(|call, _| Err(remote(&format!("failure #{call}")))),
        MemorySink::default(),
    );

    let result = h.orchestrator.run_batch(build_jobs(&dataset(3), &[])).await;
    assert_matches!(
        result,
        Err(PipelineError::AllJobsFailed { total: 3, last_error }) if last_error.contains("failure #8")
    );
    assert_eq!(h.executor.calls(), 9);
}

#[tokio::test(start_paused = true)]
async fn retries_move_to_fresh_nodes_until_success() {
    let registry = registry(3);
    let executor = Arc::new(FakeExecutor::new(|call, _| {
        if call < 2 {
            Err(ExecutorError::Connection("reset".into()))
        } else {
            Ok(())
        }
    }));
    let dispatcher = JobDispatcher::new(Arc::clone(&registry), executor.clone());
    let job = build_jobs(&dataset(1), &[]).remove(0);

    let outcome = dispatcher.dispatch(job).await;

    let artifact = match outcome {
        ExecutionOutcome::Success { artifact, .. } => artifact,
        other => panic!("expected success, got {other:?}"),
    };
    let used: Vec<String> = executor
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|(address, _)| address.clone())
        .collect();
    assert_eq!(used.iter().collect::<HashSet<_>>().len(), 3);
    assert_eq!(artifact.bytes, used[2].as_bytes());

    let nodes = registry.snapshot();
    let unresponsive: Vec<&str> = nodes
        .iter()
        .filter(|n| n.state == NodeState::Unresponsive)
        .map(|n| n.address.as_str())
        .collect();
    assert_eq!(unresponsive, vec![used[0].as_str(), used[1].as_str()]);
    assert!(nodes
        .iter()
        .filter(|n| n.state == NodeState::Unresponsive)
        .all(|n| n.failures == 1));
    assert_eq!(registry.state_of(&used[2]), Some(NodeState::Available));
}

#[tokio::test]
async fn parallel_batch_keeps_job_association() {
    let registry = registry(4);
    let executor = Arc::new(FakeExecutor::new(|_, _| Ok(())));
    let dispatcher = Arc::new(JobDispatcher::new(Arc::clone(&registry), executor.clone()));
    let orchestrator = BatchOrchestrator::new(
        dispatcher,
        Arc::new(StaticDataset(Vec::new())),
        Arc::new(MemorySink::default()),
    )
    .with_max_parallel_jobs(4);

    let report = orchestrator.run_batch(build_jobs(&dataset(10), &[])).await.unwrap();

    let names: Vec<String> = report.artifacts.iter().map(|a| a.name.clone()).collect();
    let expected: Vec<String> = (1..=10).map(|i| format!("img{i:02}.png")).collect();
    assert_eq!(names, expected);
    assert_eq!(registry.available_count(), 4);
}

// -- evaluation ------------------------------------------------------------

#[tokio::test]
async fn evaluation_validates_runs_and_stores() {
    let h = harness(2, 2, FakeExecutor::new(|_, _| Ok(())), MemorySink::default());
    let args = RunArgs::new("set", "baseline")
        .with_generation_params(vec![ParamAssignment::new("KSampler", "steps", 20)]);

    let report = h.orchestrator.run_evaluation(&args).await.unwrap();
    assert_eq!(report.artifacts.len(), 2);

    let runs = h.sink.runs.lock().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].0.run_name, "baseline");
    assert_eq!(runs[0].1, 2);
    assert!(h
        .executor
        .seen
        .lock()
        .unwrap()
        .iter()
        .all(|(_, params)| params == &args.generation_params));
}

#[tokio::test]
async fn invalid_fixed_params_fail_before_any_job() {
    let h = harness(
        2,
        2,
        FakeExecutor::new(|_, _| Ok(())).rejecting(json!(20)),
        MemorySink::default(),
    );
    let args = RunArgs::new("set", "baseline")
        .with_generation_params(vec![ParamAssignment::new("KSampler", "steps", 20)]);

    assert_matches!(
        h.orchestrator.run_evaluation(&args).await,
        Err(PipelineError::Validation(_))
    );
    assert_eq!(h.executor.calls(), 0);
    assert!(h.sink.runs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sink_failure_is_reported() {
    let h = harness(
        1,
        1,
        FakeExecutor::new(|_, _| Ok(())),
        MemorySink {
            fail: true,
            ..MemorySink::default()
        },
    );
    assert_matches!(
        h.orchestrator.run_evaluation(&RunArgs::new("set", "run")).await,
        Err(PipelineError::Sink(msg)) if msg.contains("disk full")
    );
}

// -- grid search -----------------------------------------------------------

fn specs() -> Vec<HyperparameterSpec> {
    vec![
        HyperparameterSpec::new("KSampler", "steps", vec![json!(10), json!(15)]),
        HyperparameterSpec::new("KSampler", "sampler_name", vec![json!("a"), json!("b")]),
    ]
}

#[tokio::test]
async fn grid_search_runs_each_point_in_order() {
    let h = harness(2, 2, FakeExecutor::new(|_, _| Ok(())), MemorySink::default());
    let base = RunArgs::new("set", "base")
        .with_generation_params(vec![ParamAssignment::new("KSampler", "denoise", 0.8)]);

    let results = h.orchestrator.run_grid_search(&base, &specs()).await.unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.result.is_ok()));

    let runs = h.sink.runs.lock().unwrap();
    let names: Vec<&str> = runs.iter().map(|(args, _, _)| args.run_name.as_str()).collect();
    assert_eq!(names, vec!["hs_base_0", "hs_base_1", "hs_base_2", "hs_base_3"]);

    let point_values: Vec<(Value, Value)> = runs
        .iter()
        .map(|(args, _, _)| {
            let p = &args.generation_params;
            assert_eq!(p[0], ParamAssignment::new("KSampler", "denoise", 0.8));
            (p[1].value.clone(), p[2].value.clone())
        })
        .collect();
    assert_eq!(
        point_values,
        vec![
            (json!(10), json!("a")),
            (json!(10), json!("b")),
            (json!(15), json!("a")),
            (json!(15), json!("b")),
        ]
    );
    assert_eq!(h.executor.calls(), 8);
}

#[tokio::test(start_paused = true)]
async fn failed_grid_point_does_not_abort_the_rest() {
    let h = harness(
        20,
        2,
        FakeExecutor::new(|_, job| {
            if job.params.iter().any(|p| p.value == json!(15)) {
                Err(remote("diverged"))
            } else {
                Ok(())
            }
        }),
        MemorySink::default(),
    );

    let results = h
        .orchestrator
        .run_grid_search(&RunArgs::new("set", "base"), &specs())
        .await
        .unwrap();

    assert_eq!(results.len(), 4);
    assert!(results[0].result.is_ok());
    assert!(results[1].result.is_ok());
    assert_matches!(&results[2].result, Err(PipelineError::AllJobsFailed { total: 2, .. }));
    assert_matches!(&results[3].result, Err(PipelineError::AllJobsFailed { total: 2, .. }));
    assert_eq!(results[3].args.run_name, "hs_base_3");
    assert_eq!(h.sink.runs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn invalid_candidate_value_fails_the_search_up_front() {
    let h = harness(
        2,
        2,
        FakeExecutor::new(|_, _| Ok(())).rejecting(json!("b")),
        MemorySink::default(),
    );

    assert_matches!(
        h.orchestrator
            .run_grid_search(&RunArgs::new("set", "base"), &specs())
            .await,
        Err(PipelineError::Validation(msg)) if msg.contains("not accepted")
    );
    assert_eq!(h.executor.calls(), 0);
    assert!(h.sink.runs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_specs_are_rejected() {
    let h = harness(1, 1, FakeExecutor::new(|_, _| Ok(())), MemorySink::default());
    assert_matches!(
        h.orchestrator
            .run_grid_search(&RunArgs::new("set", "base"), &[])
            .await,
        Err(PipelineError::Validation(_))
    );
    assert_eq!(h.executor.calls(), 0);
}
