// Step Runner
// Executes a cell's steps in order, stopping at the first failure

use crate::error::EngineError;
use crate::execution::cell::CellId;
use crate::execution::coverage::{CoverageFragment, CoverageReport};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::runners::{OutputCallback, Script, ShellRunner};
use crate::workflow::models::{ConditionContext, StepSpec};
use crate::workflow::template::{render, TemplateScope};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Variable pointing at the cell's private scratch directory
pub const CELL_DIR_VAR: &str = "GANTRY_CELL_DIR";

/// Status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Run condition was false
    Skipped,
    /// Not launched because the matrix is failing fast
    Canceled,
}

impl StepStatus {
    /// Whether the step's command actually ran
    pub fn executed(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(serialize_with = "crate::execution::report::serialize_millis")]
    pub duration: Duration,
    #[serde(skip)]
    pub coverage: Option<CoverageFragment>,
    pub append: bool,
}

impl StepResult {
    fn not_run(index: usize, step: &StepSpec, status: StepStatus) -> Self {
        Self {
            index,
            name: step.name.clone(),
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            coverage: None,
            append: step.append,
        }
    }

    /// The error describing this step's failure
    pub fn failure(&self) -> Option<EngineError> {
        (self.status == StepStatus::Failed).then(|| EngineError::StepFailed {
            step: self.name.clone(),
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        })
    }
}

/// Results of running a cell's step list
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepRun {
    /// Executed and skipped steps in order; nothing after a failure
    pub results: Vec<StepResult>,
    /// Index of the first step not launched because of fail-fast
    pub canceled_from: Option<usize>,
}

impl StepRun {
    pub fn executed(&self) -> impl Iterator<Item = &StepResult> {
        self.results.iter().filter(|r| r.status.executed())
    }

    pub fn failed_step(&self) -> Option<&StepResult> {
        self.results.iter().find(|r| r.status == StepStatus::Failed)
    }

    pub fn succeeded(&self) -> bool {
        self.failed_step().is_none() && self.canceled_from.is_none()
    }
}

/// Shared flag telling cells to stop launching steps
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a step list runs against
pub struct StepContext<'a> {
    pub cell: &'a CellId,
    pub report_version: Option<&'a str>,
    /// Pipeline-wide variables, also the template scope
    pub pipeline_env: &'a BTreeMap<String, String>,
    /// Cell variables (environment, services) layered over the pipeline env
    pub cell_env: &'a HashMap<String, String>,
    pub workspace: &'a Path,
    /// Private directory of the cell; relative coverage paths resolve here
    pub cell_dir: &'a Path,
}

impl StepContext<'_> {
    fn condition_context(&self) -> ConditionContext<'_> {
        ConditionContext {
            version: self.cell.version.as_deref(),
            report_version: self.report_version,
            env: self.pipeline_env,
        }
    }

    fn step_env(&self, step: &StepSpec) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = self
            .pipeline_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(self.cell_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert(
            CELL_DIR_VAR.to_string(),
            self.cell_dir.to_string_lossy().to_string(),
        );
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Runs step lists through the shell
#[derive(Debug, Clone)]
pub struct StepRunner {
    shell: ShellRunner,
    events: Option<ProgressSender>,
}

impl StepRunner {
    pub fn new(shell: ShellRunner, events: Option<ProgressSender>) -> Self {
        Self { shell, events }
    }

    /// Run `steps` in order.
    ///
    /// A false run condition skips the step. The first failing step ends the
    /// run; later steps are not recorded. Once `cancel` fires no further step
    /// is launched, while the running one finishes.
    pub async fn run(&self, steps: &[StepSpec], ctx: &StepContext<'_>, cancel: &CancelSignal) -> StepRun {
        let mut run = StepRun::default();
        let conditions = ctx.condition_context();

        for (index, step) in steps.iter().enumerate() {
            if cancel.is_canceled() {
                debug!(cell = %ctx.cell, step = %step.name, "fail-fast: not launching remaining steps");
                run.canceled_from = Some(index);
                break;
            }

            if let Some(condition) = &step.condition {
                if !condition.evaluate(&conditions) {
                    self.events.send_event(ExecutionEvent::StepSkipped {
                        cell: ctx.cell.clone(),
                        step_name: step.name.clone(),
                        step_index: index,
                        reason: "run condition is false".to_string(),
                    });
                    run.results
                        .push(StepResult::not_run(index, step, StepStatus::Skipped));
                    continue;
                }
            }

            let result = self.run_step(index, step, ctx).await;
            let failed = result.status == StepStatus::Failed;
            run.results.push(result);
            if failed {
                break;
            }
        }

        run
    }

    async fn run_step(&self, index: usize, step: &StepSpec, ctx: &StepContext<'_>) -> StepResult {
        self.events
            .send_event(ExecutionEvent::step_started(ctx.cell, &step.name, index));
        let started = Instant::now();

        let scope = TemplateScope {
            env: ctx.pipeline_env,
            version: ctx.cell.version.as_deref(),
        };
        let mut result = match render(&step.run, &scope) {
            Ok(command) => {
                let env = ctx.step_env(step);
                let output = self
                    .shell
                    .run(
                        Script::new(&command, ctx.workspace)
                            .env(&env)
                            .on_line(self.output_callback(ctx.cell, index)),
                    )
                    .await;

                StepResult {
                    status: if output.success() {
                        StepStatus::Succeeded
                    } else {
                        StepStatus::Failed
                    },
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    ..StepResult::not_run(index, step, StepStatus::Failed)
                }
            }
            Err(e) => StepResult {
                stderr: e.to_string(),
                ..StepResult::not_run(index, step, StepStatus::Failed)
            },
        };
        result.duration = started.elapsed();

        if result.status == StepStatus::Succeeded {
            if let Some(path) = &step.coverage {
                result.coverage = self.read_fragment(ctx, step, &resolve(ctx.cell_dir, path));
            }
        }

        self.events.send_event(ExecutionEvent::StepCompleted {
            cell: ctx.cell.clone(),
            step_name: step.name.clone(),
            step_index: index,
            status: result.status,
            duration: result.duration,
            exit_code: result.exit_code,
        });
        result
    }

    fn output_callback(&self, cell: &CellId, index: usize) -> OutputCallback {
        let events = self.events.clone();
        let cell = cell.clone();
        Arc::new(move |line: &str, is_error: bool| {
            events.send_event(ExecutionEvent::step_output(&cell, index, line, is_error));
        })
    }

    fn read_fragment(&self, ctx: &StepContext<'_>, step: &StepSpec, path: &Path) -> Option<CoverageFragment> {
        match CoverageReport::from_file(path) {
            Ok(fragment) => Some(fragment),
            Err(e) => {
                let message = format!(
                    "step '{}' did not produce a readable coverage fragment at {}: {}",
                    step.name,
                    path.display(),
                    e
                );
                warn!(cell = %ctx.cell, "{}", message);
                self.events
                    .send_event(ExecutionEvent::warning(message, Some(ctx.cell.clone())));
                None
            }
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::step;
    use super::*;

    use crate::execution::events::progress_channel;
    use crate::workflow::models::RunCondition;

    struct Fixture {
        dir: tempfile::TempDir,
        cell: CellId,
        pipeline_env: BTreeMap<String, String>,
        cell_env: HashMap<String, String>,
    }

    impl Fixture {
        fn new(version: &str) -> Self {
            let mut pipeline_env = BTreeMap::new();
            pipeline_env.insert("LATEST_PY_VERSION".to_string(), "3.10".to_string());
            pipeline_env.insert("XDIST_ARGS".to_string(), "--numprocesses=auto".to_string());
            Self {
                dir: tempfile::tempdir().unwrap(),
                cell: CellId::matrix("test", version),
                pipeline_env,
                cell_env: HashMap::new(),
            }
        }

        fn ctx(&self) -> StepContext<'_> {
            StepContext {
                cell: &self.cell,
                report_version: Some("3.10"),
                pipeline_env: &self.pipeline_env,
                cell_env: &self.cell_env,
                workspace: self.dir.path(),
                cell_dir: self.dir.path(),
            }
        }
    }

    #[tokio::test]
    async fn test_failure_at_step_k_records_k_results() {
        let fixture = Fixture::new("3.8");
        let steps = vec![
            step("install", "echo ok"),
            step("unit", "echo 'FAILED test_session.py' >&2; exit 2"),
            step("integration", "touch should-not-exist"),
        ];

        let run = StepRunner::new(ShellRunner::new(), None)
            .run(&steps, &fixture.ctx(), &CancelSignal::new())
            .await;

        assert_eq!(run.results.len(), 2);
        assert_eq!(run.executed().count(), 2);
        assert_eq!(run.results[0].status, StepStatus::Succeeded);

        let failed = run.failed_step().unwrap();
        assert_eq!(failed.name, "unit");
        assert_eq!(failed.exit_code, Some(2));
        assert_eq!(failed.stderr, "FAILED test_session.py");
        assert!(matches!(failed.failure(), Some(EngineError::StepFailed { exit_code: Some(2), .. })));
        assert!(!run.succeeded());
        assert!(!fixture.dir.path().join("should-not-exist").exists());
    }

    #[tokio::test]
    async fn test_binary_output_does_not_fail_step() {
        let fixture = Fixture::new("3.10");
        let steps = vec![
            step(
                "pytest",
                r"printf 'caf\351\n'; sleep 0.2; i=0; while [ $i -lt 2000 ]; do echo passed$i; i=$((i+1)); done; exit 0",
            ),
            step("after", "echo reached"),
        ];

        let run = StepRunner::new(ShellRunner::new(), None)
            .run(&steps, &fixture.ctx(), &CancelSignal::new())
            .await;

        assert!(run.succeeded());
        assert_eq!(run.results[0].exit_code, Some(0));
        assert!(run.results[0].stdout.ends_with("passed1999"));
        assert_eq!(run.results[1].stdout, "reached");
    }

    #[tokio::test]
    async fn test_conditions_skip_without_failing() {
        let fixture = Fixture::new("3.9");
        let mut latest_only = step("coverage upload prep", "echo latest");
        latest_only.condition = Some(RunCondition::ReportVersion);

        let run = StepRunner::new(ShellRunner::new(), None)
            .run(
                &[latest_only, step("unit", "echo unit")],
                &fixture.ctx(),
                &CancelSignal::new(),
            )
            .await;

        assert!(run.succeeded());
        assert_eq!(run.results[0].status, StepStatus::Skipped);
        assert_eq!(run.results[1].status, StepStatus::Succeeded);
        assert_eq!(run.executed().count(), 1);
    }

    #[tokio::test]
    async fn test_templates_and_environment_layers() {
        let mut fixture = Fixture::new("3.9");
        fixture
            .cell_env
            .insert("GANTRY_SERVICE_REDIS_PORT".to_string(), "6379".to_string());
        let mut unit = step(
            "unit",
            "echo ${{ matrix.version }} ${{ env.XDIST_ARGS }} $GANTRY_SERVICE_REDIS_PORT $MODE",
        );
        unit.env.insert("MODE".to_string(), "fast".to_string());

        let run = StepRunner::new(ShellRunner::new(), None)
            .run(&[unit], &fixture.ctx(), &CancelSignal::new())
            .await;

        assert_eq!(run.results[0].stdout, "3.9 --numprocesses=auto 6379 fast");
    }

    #[tokio::test]
    async fn test_canceled_before_launch() {
        let fixture = Fixture::new("3.7");
        let cancel = CancelSignal::new();
        cancel.cancel();

        let run = StepRunner::new(ShellRunner::new(), None)
            .run(&[step("unit", "echo unit")], &fixture.ctx(), &cancel)
            .await;

        assert!(run.results.is_empty());
        assert_eq!(run.canceled_from, Some(0));
        assert!(!run.succeeded());
    }

    #[tokio::test]
    async fn test_coverage_fragment_is_read() {
        let fixture = Fixture::new("3.10");
        let mut unit = step(
            "unit",
            r#"echo '{"files": {"a.py": {"lines": {"1": 1}}}}' > "$GANTRY_CELL_DIR/unit.json""#,
        );
        unit.coverage = Some(PathBuf::from("unit.json"));
        let mut missing = step("integration", "true");
        missing.coverage = Some(PathBuf::from("integration.json"));
        missing.append = true;

        let (tx, mut rx) = progress_channel();
        let run = StepRunner::new(ShellRunner::new(), Some(tx))
            .run(&[unit, missing], &fixture.ctx(), &CancelSignal::new())
            .await;

        assert!(run.succeeded());
        assert_eq!(run.results[0].coverage.as_ref().unwrap().covered_lines(), 1);
        assert!(run.results[1].coverage.is_none());
        assert!(run.results[1].append);

        let mut warned = false;
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::Log { message, .. } = event {
                warned |= message.contains("integration.json");
            }
        }
        assert!(warned);
    }

    #[tokio::test]
    async fn test_bad_template_fails_step() {
        let fixture = Fixture::new("3.9");

        let run = StepRunner::new(ShellRunner::new(), None)
            .run(
                &[step("broken", "echo ${{ env.NOPE }}")],
                &fixture.ctx(),
                &CancelSignal::new(),
            )
            .await;

        let failed = run.failed_step().unwrap();
        assert_eq!(failed.exit_code, None);
        assert!(failed.stderr.contains("NOPE"));
    }

    #[tokio::test]
    async fn test_output_is_streamed() {
        let fixture = Fixture::new("3.9");
        let (tx, mut rx) = progress_channel();

        StepRunner::new(ShellRunner::new(), Some(tx))
            .run(
                &[step("unit", "echo collected; echo warn >&2")],
                &fixture.ctx(),
                &CancelSignal::new(),
            )
            .await;

        let mut lines = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::StepOutput { output, is_error, .. } = event {
                lines.push((output, is_error));
            }
        }
        assert!(lines.contains(&("collected".to_string(), false)));
        assert!(lines.contains(&("warn".to_string(), true)));
    }
}
