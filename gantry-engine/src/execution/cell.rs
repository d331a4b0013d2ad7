// Matrix Cells
// One version's run: services, environment, steps, coverage and teardown

use crate::cache::CacheKey;
use crate::environment::EnvironmentBuilder;
use crate::error::{EngineError, FailureKind};
use crate::execution::coverage::{CoverageAggregator, CoverageForwarder, CoverageReport, ForwardOutcome};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::step_runner::{CancelSignal, StepContext, StepResult, StepRun, StepRunner};
use crate::services::ServiceProvisioner;
use crate::workflow::models::PipelineSpec;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Identity of a cell: job name plus matrix version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId {
    pub job: String,
    pub version: Option<String>,
}

impl CellId {
    pub fn matrix(job: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            version: Some(version.into()),
        }
    }

    /// A job without a matrix
    pub fn single(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            version: None,
        }
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{} ({})", self.job, version),
            None => f.write_str(&self.job),
        }
    }
}

/// One expansion of the pipeline for a single version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixCell {
    pub id: CellId,
    /// Position in the matrix
    pub index: usize,
    pub cache_key: CacheKey,
}

impl MatrixCell {
    pub fn version(&self) -> &str {
        &self.cache_key.version
    }
}

/// Final state of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Succeeded,
    Failed,
    /// Never launched because the matrix failed fast
    NotStarted,
}

impl fmt::Display for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CellStatus::Succeeded => "succeeded",
            CellStatus::Failed => "failed",
            CellStatus::NotStarted => "not started",
        })
    }
}

/// Why a cell failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Failing step, for step failures
    pub step: Option<String>,
    pub exit_code: Option<i32>,
    /// Captured output of the failing process
    pub output: Option<String>,
}

impl From<&EngineError> for CellFailure {
    fn from(error: &EngineError) -> Self {
        let step = match error {
            EngineError::StepFailed { step, .. } => Some(step.clone()),
            _ => None,
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            step,
            exit_code: error.exit_code(),
            output: error.captured_output(),
        }
    }
}

/// Everything known about a finished cell
#[derive(Debug, Clone, Serialize)]
pub struct CellResult {
    pub cell: CellId,
    pub status: CellStatus,
    pub failure: Option<CellFailure>,
    /// Executed and skipped steps; the failing step is last
    pub steps: Vec<StepResult>,
    /// Index of the first step not launched because of fail-fast
    pub canceled_from: Option<usize>,
    pub cache_key: Option<String>,
    pub cache_hit: Option<bool>,
    pub services: Vec<String>,
    pub services_released: usize,
    #[serde(skip)]
    pub coverage: Option<CoverageReport>,
    pub coverage_forwarded: bool,
    #[serde(serialize_with = "crate::execution::report::serialize_millis")]
    pub duration: Duration,
}

impl CellResult {
    pub fn new(cell: CellId) -> Self {
        Self {
            cell,
            status: CellStatus::Succeeded,
            failure: None,
            steps: Vec::new(),
            canceled_from: None,
            cache_key: None,
            cache_hit: None,
            services: Vec::new(),
            services_released: 0,
            coverage: None,
            coverage_forwarded: false,
            duration: Duration::ZERO,
        }
    }

    pub fn not_started(cell: CellId) -> Self {
        Self {
            status: CellStatus::NotStarted,
            ..Self::new(cell)
        }
    }

    /// A cell that failed before or outside its steps
    pub fn failed(cell: CellId, error: &EngineError) -> Self {
        let mut result = Self::new(cell);
        result.fail(error);
        result
    }

    fn fail(&mut self, error: &EngineError) {
        self.status = CellStatus::Failed;
        self.failure = Some(CellFailure::from(error));
    }

    /// Record the step run, failing the cell on a failed or canceled step
    pub fn apply_steps(&mut self, run: StepRun) {
        if let Some(error) = run.failed_step().and_then(StepResult::failure) {
            self.fail(&error);
        } else if let Some(index) = run.canceled_from {
            self.status = CellStatus::Failed;
            self.failure = Some(CellFailure {
                kind: FailureKind::Canceled,
                message: format!("canceled by fail-fast before step {}", index + 1),
                step: None,
                exit_code: None,
                output: None,
            });
        }
        self.canceled_from = run.canceled_from;
        self.steps = run.results;
    }

    pub fn succeeded(&self) -> bool {
        self.status == CellStatus::Succeeded
    }

    /// Steps whose command actually ran
    pub fn executed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| s.status.executed())
    }
}

/// Runs single matrix cells
pub struct CellRunner {
    pub(crate) pipeline: Arc<PipelineSpec>,
    pub(crate) provisioner: ServiceProvisioner,
    pub(crate) environments: EnvironmentBuilder,
    pub(crate) steps: StepRunner,
    pub(crate) forwarder: Arc<CoverageForwarder>,
    pub(crate) workspace: PathBuf,
    pub(crate) keep_work_dirs: bool,
    pub(crate) events: Option<ProgressSender>,
}

impl CellRunner {
    /// Run one cell to completion.
    ///
    /// Services are released exactly once on every path that started them.
    #[instrument(skip_all, fields(cell = %cell.id))]
    pub async fn run(&self, cell: MatrixCell, cancel: CancelSignal) -> CellResult {
        let started = Instant::now();
        let mut result = CellResult::new(cell.id.clone());
        result.cache_key = Some(cell.cache_key.to_string());

        self.events.send_event(ExecutionEvent::CellStarted {
            cell: cell.id.clone(),
            total_steps: self.pipeline.steps.len(),
        });

        let mut services = match self
            .provisioner
            .start_all(&self.pipeline.services, &cell.id)
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                warn!(error = %e, "services unavailable");
                result.fail(&e);
                return self.finish(result, started);
            }
        };
        result.services = services.handles().iter().map(|h| h.name.clone()).collect();
        if !result.services.is_empty() {
            self.events.send_event(ExecutionEvent::ServicesReady {
                cell: cell.id.clone(),
                services: result.services.clone(),
            });
        }

        let run = match self
            .environments
            .resolve(cell.version(), &cell.cache_key.lockfile_hash)
            .await
        {
            Ok((handle, hit)) => {
                result.cache_hit = Some(hit);
                self.events.send_event(ExecutionEvent::EnvironmentResolved {
                    cell: cell.id.clone(),
                    cache_key: cell.cache_key.to_string(),
                    cache_hit: hit,
                });

                let mut cell_env: HashMap<String, String> = handle.env_vars();
                cell_env.extend(services.env_vars());
                let cell_dir = handle.dir.parent().unwrap_or(&handle.dir).to_path_buf();
                let ctx = StepContext {
                    cell: &cell.id,
                    report_version: self.pipeline.report_version(),
                    pipeline_env: &self.pipeline.env,
                    cell_env: &cell_env,
                    workspace: &self.workspace,
                    cell_dir: &cell_dir,
                };
                Some(self.steps.run(&self.pipeline.steps, &ctx, &cancel).await)
            }
            Err(e) => {
                warn!(error = %e, "environment could not be resolved");
                result.fail(&e);
                None
            }
        };

        result.services_released = services.release().await;

        if let Some(run) = run {
            result.apply_steps(run);
            result.coverage = aggregate(&result.steps);
            if result.succeeded() {
                self.forward_coverage(&mut result).await;
            }
        }

        if !self.keep_work_dirs {
            if let Err(e) = self.environments.discard(cell.version()) {
                warn!(error = %e, "could not remove cell work directory");
            }
        }

        self.finish(result, started)
    }

    async fn forward_coverage(&self, result: &mut CellResult) {
        let Some(report) = &result.coverage else {
            return;
        };

        match self.forwarder.offer(&result.cell, report).await {
            ForwardOutcome::Forwarded => {
                result.coverage_forwarded = true;
                self.events.send_event(ExecutionEvent::CoverageForwarded {
                    cell: result.cell.clone(),
                    sink: self.forwarder.sink_description(),
                    files: report.files.len(),
                });
            }
            ForwardOutcome::SinkUnreachable(reason) => {
                self.events.send_event(ExecutionEvent::warning(
                    format!("coverage report not delivered: {}", reason),
                    Some(result.cell.clone()),
                ));
            }
            ForwardOutcome::NotDesignated | ForwardOutcome::AlreadyForwarded => {}
        }
    }

    fn finish(&self, mut result: CellResult, started: Instant) -> CellResult {
        result.duration = started.elapsed();
        info!(status = %result.status, duration = ?result.duration, "cell finished");
        self.events.send_event(ExecutionEvent::CellCompleted {
            cell: result.cell.clone(),
            status: result.status,
            duration: result.duration,
        });
        result
    }
}

/// Merge the coverage fragments of `steps` in order
pub fn aggregate(steps: &[StepResult]) -> Option<CoverageReport> {
    let mut aggregator = CoverageAggregator::new();
    for step in steps {
        if let Some(fragment) = &step.coverage {
            aggregator.add(fragment, step.append);
        }
    }
    aggregator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cache::{hash_bytes, CacheStore};
    use crate::environment::NoopInstaller;
    use crate::execution::coverage::testing::RecordingSink;
    use crate::execution::step_runner::testing::step;
    use crate::runners::ShellRunner;
    use crate::services::testing::{service, FakeBackend};
    use crate::workflow::models::{MatrixSpec, ServiceSpec, StepSpec};

    fn pipeline(services: Vec<ServiceSpec>, steps: Vec<StepSpec>) -> PipelineSpec {
        PipelineSpec {
            name: "CI".to_string(),
            triggers: Vec::new(),
            env: Default::default(),
            matrix: MatrixSpec {
                versions: vec!["3.9".to_string(), "3.10".to_string()],
                fail_fast: true,
                fail_fast_scope: Default::default(),
                max_parallel: None,
            },
            report_version: Some("3.10".to_string()),
            report_version_env: "LATEST_PY_VERSION".to_string(),
            services,
            lockfile: None,
            install: None,
            steps,
            analysis: None,
            report: None,
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        backend: Arc<FakeBackend>,
        sink: Arc<RecordingSink>,
        runner: CellRunner,
    }

    fn harness(spec: PipelineSpec, backend: FakeBackend) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(backend);
        let sink = Arc::new(RecordingSink::default());
        let runner = CellRunner {
            provisioner: ServiceProvisioner::new(
                backend.clone(),
                Duration::from_millis(100),
                Duration::from_millis(10),
            ),
            environments: EnvironmentBuilder::new(
                Arc::new(CacheStore::new(dir.path().join("cache"))),
                Arc::new(NoopInstaller),
                dir.path().join("work"),
                dir.path(),
            ),
            steps: StepRunner::new(ShellRunner::new(), None),
            forwarder: Arc::new(CoverageForwarder::new(
                spec.report_version().map(String::from),
                sink.clone(),
            )),
            workspace: dir.path().to_path_buf(),
            keep_work_dirs: false,
            events: None,
            pipeline: Arc::new(spec),
        };
        Harness {
            dir,
            backend,
            sink,
            runner,
        }
    }

    fn cell(version: &str) -> MatrixCell {
        MatrixCell {
            id: CellId::matrix("test", version),
            index: 0,
            cache_key: CacheKey::new(version, hash_bytes(b"poetry.lock")),
        }
    }

    #[tokio::test]
    async fn test_failing_step_releases_services_once() {
        let spec = pipeline(
            vec![service("redis", "6379:6379"), service("mongo", "27017:27017")],
            vec![
                step("one", "echo one"),
                step("two", "echo boom >&2; exit 4"),
                step("three", "echo three"),
            ],
        );
        let h = harness(spec, FakeBackend::default());

        let result = h.runner.run(cell("3.9"), CancelSignal::new()).await;

        assert_eq!(result.status, CellStatus::Failed);
        assert_eq!(result.executed_steps().count(), 2);
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::StepFailed);
        assert_eq!(failure.step.as_deref(), Some("two"));
        assert_eq!(failure.exit_code, Some(4));
        assert_eq!(failure.output.as_deref(), Some("boom"));
        assert_eq!(result.services_released, 2);
        assert_eq!(h.backend.stop_count(), 2);
    }

    #[tokio::test]
    async fn test_unready_service_runs_no_steps() {
        let spec = pipeline(
            vec![service("redis", "6379:6379"), service("dynamodb", "8000:8000")],
            vec![step("marker", "touch ran")],
        );
        let backend = FakeBackend {
            never_ready: ["dynamodb".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let h = harness(spec, backend);

        let result = h.runner.run(cell("3.9"), CancelSignal::new()).await;

        assert_eq!(result.status, CellStatus::Failed);
        assert_eq!(
            result.failure.as_ref().unwrap().kind,
            FailureKind::ServiceUnavailable
        );
        assert!(result.steps.is_empty());
        assert!(!h.dir.path().join("ran").exists());
        assert_eq!(h.backend.stop_count(), 2);
    }

    #[tokio::test]
    async fn test_designated_cell_forwards_merged_coverage() {
        let mut unit = step(
            "unit",
            r#"echo '{"files": {"a.py": {"lines": {"1": 1, "2": 0}}}}' > "$GANTRY_CELL_DIR/cov.json""#,
        );
        unit.coverage = Some(PathBuf::from("cov.json"));
        let mut integration = step(
            "integration",
            r#"echo '{"files": {"a.py": {"lines": {"2": 5}}}}' > "$GANTRY_CELL_DIR/cov2.json""#,
        );
        integration.coverage = Some(PathBuf::from("cov2.json"));
        integration.append = true;

        let h = harness(pipeline(Vec::new(), vec![unit, integration]), FakeBackend::default());

        let other = h.runner.run(cell("3.9"), CancelSignal::new()).await;
        assert!(other.succeeded());
        assert!(!other.coverage_forwarded);
        assert_eq!(other.coverage.as_ref().unwrap().covered_lines(), 2);

        let latest = h.runner.run(cell("3.10"), CancelSignal::new()).await;
        assert!(latest.coverage_forwarded);
        assert_eq!(h.sink.count(), 1);
        assert_eq!(h.sink.received.lock().unwrap()[0].covered_lines(), 2);
        assert_eq!(latest.cache_hit, Some(false));
    }

    #[tokio::test]
    async fn test_failed_designated_cell_does_not_forward() {
        let mut unit = step(
            "unit",
            r#"echo '{"files": {}}' > "$GANTRY_CELL_DIR/cov.json""#,
        );
        unit.coverage = Some(PathBuf::from("cov.json"));
        let h = harness(
            pipeline(Vec::new(), vec![unit, step("lint", "exit 1")]),
            FakeBackend::default(),
        );

        let result = h.runner.run(cell("3.10"), CancelSignal::new()).await;

        assert!(!result.succeeded());
        assert!(!result.coverage_forwarded);
        assert_eq!(h.sink.count(), 0);
    }

    #[test]
    fn test_cell_id_display() {
        assert_eq!(CellId::matrix("test", "3.10").to_string(), "test (3.10)");
        assert_eq!(CellId::single("analysis").to_string(), "analysis");
    }
}
