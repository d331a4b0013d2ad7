// Pipeline Runner
// Trigger gate, matrix and analysis job run concurrently, final outcome

use crate::cache::{hash_bytes, hash_lockfile, CacheStore};
use crate::config::EngineConfig;
use crate::environment::{DependencyInstaller, EnvironmentBuilder, NoopInstaller, ShellInstaller};
use crate::error::{EngineError, EngineResult};
use crate::execution::analysis::AnalysisJob;
use crate::execution::cell::{CellId, CellResult, CellRunner};
use crate::execution::coverage::{CommandSink, CoverageForwarder, FileSink, NullSink, ReportingSink};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::scheduler::MatrixScheduler;
use crate::execution::step_runner::StepRunner;
use crate::runners::{Shell, ShellRunner};
use crate::services::{DockerBackend, ServiceBackend, ServiceProvisioner};
use crate::workflow::models::{PipelineSpec, ReportSinkSpec};
use crate::workflow::trigger::TriggerEvent;

use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Everything a completed run produced
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub trigger: String,
    pub cells: Vec<CellResult>,
    pub analysis: Option<CellResult>,
    /// Cell whose coverage reached the sink
    pub coverage_forwarded_from: Option<CellId>,
    #[serde(serialize_with = "crate::execution::report::serialize_millis")]
    pub duration: Duration,
}

impl PipelineReport {
    pub fn matrix_succeeded(&self) -> bool {
        self.cells.iter().all(CellResult::succeeded)
    }

    pub fn analysis_succeeded(&self) -> bool {
        self.analysis.as_ref().map_or(true, CellResult::succeeded)
    }

    pub fn success(&self) -> bool {
        self.matrix_succeeded() && self.analysis_succeeded()
    }
}

/// Result of [`PipelineRunner::run`]
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// No trigger rule matched; nothing ran
    NotTriggered { trigger: String },
    Completed(PipelineReport),
}

impl PipelineOutcome {
    /// 0 iff every cell and the analysis job succeeded
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineOutcome::NotTriggered { .. } => 0,
            PipelineOutcome::Completed(report) if report.success() => 0,
            PipelineOutcome::Completed(_) => 1,
        }
    }

    pub fn report(&self) -> Option<&PipelineReport> {
        match self {
            PipelineOutcome::Completed(report) => Some(report),
            PipelineOutcome::NotTriggered { .. } => None,
        }
    }
}

/// Runs a pipeline definition end to end
pub struct PipelineRunner {
    spec: Arc<PipelineSpec>,
    config: EngineConfig,
    workspace: PathBuf,
    backend: Option<Arc<dyn ServiceBackend>>,
    installer: Option<Arc<dyn DependencyInstaller>>,
    sink: Option<Arc<dyn ReportingSink>>,
    fail_fast: Option<bool>,
    max_parallel: Option<usize>,
    events: Option<ProgressSender>,
}

impl PipelineRunner {
    pub fn new(spec: PipelineSpec, config: EngineConfig) -> Self {
        Self {
            spec: Arc::new(spec),
            config,
            workspace: PathBuf::from("."),
            backend: None,
            installer: None,
            sink: None,
            fail_fast: None,
            max_parallel: None,
            events: None,
        }
    }

    /// Directory steps run in and relative paths resolve against
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Replace the docker backend
    pub fn with_backend(mut self, backend: Arc<dyn ServiceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the installer built from the `install` template
    pub fn with_installer(mut self, installer: Arc<dyn DependencyInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Replace the sink built from the `report` section
    pub fn with_sink(mut self, sink: Arc<dyn ReportingSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Override the matrix fail-fast flag
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = Some(fail_fast);
        self
    }

    /// Override the matrix parallelism
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn with_progress(mut self, events: ProgressSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    /// Run the pipeline for `event`.
    ///
    /// Configuration problems (unknown shell, unreadable lockfile) are
    /// returned as errors before anything starts; everything after that is
    /// reported per cell.
    pub async fn run(&self, event: &TriggerEvent) -> EngineResult<PipelineOutcome> {
        let trigger = event.to_string();
        if !self.spec.should_run(event) {
            info!(pipeline = %self.spec.name, trigger = %trigger, "no trigger rule matched");
            self.events.send_event(ExecutionEvent::PipelineNotTriggered {
                pipeline_name: self.spec.name.clone(),
                trigger: trigger.clone(),
            });
            return Ok(PipelineOutcome::NotTriggered { trigger });
        }

        let started = Instant::now();
        let shell: Shell = self
            .config
            .shell
            .parse()
            .map_err(EngineError::InvalidInput)?;
        let shell_runner = ShellRunner::for_shell(shell);

        let lockfile_hash = match &self.spec.lockfile {
            Some(path) => hash_lockfile(&self.resolve(path))?,
            None => hash_bytes(b""),
        };

        let run_dir = self.config.work_dir.join(run_dir_name(&self.spec.name));
        fs::create_dir_all(&run_dir)?;

        let pipeline_env = Arc::new(self.spec.env.clone());
        let step_runner = StepRunner::new(shell_runner.clone(), self.events.clone());
        let sink = self.sink(&shell_runner);
        let forwarder = Arc::new(CoverageForwarder::new(
            self.spec.report_version().map(String::from),
            sink,
        ));

        let cell_runner = Arc::new(CellRunner {
            pipeline: self.spec.clone(),
            provisioner: ServiceProvisioner::new(
                self.backend(),
                self.config.readiness_timeout(),
                self.config.readiness_interval(),
            ),
            environments: EnvironmentBuilder::new(
                Arc::new(CacheStore::new(&self.config.cache_dir)),
                self.installer(&shell_runner, &pipeline_env),
                run_dir.clone(),
                self.workspace.clone(),
            ),
            steps: step_runner.clone(),
            forwarder,
            workspace: self.workspace.clone(),
            keep_work_dirs: self.config.keep_work_dirs,
            events: self.events.clone(),
        });

        let mut scheduler = MatrixScheduler::for_pipeline(&self.spec)
            .with_max_parallel(
                self.max_parallel
                    .or(self.spec.matrix.max_parallel)
                    .or(self.config.max_parallel),
            );
        if let Some(fail_fast) = self.fail_fast {
            scheduler = scheduler.with_fail_fast(fail_fast);
        }
        if let Some(events) = &self.events {
            scheduler = scheduler.with_progress(events.clone());
        }

        let cells = MatrixScheduler::expand(&self.spec, &lockfile_hash);
        self.events.send_event(ExecutionEvent::pipeline_started(
            &self.spec.name,
            &trigger,
            cells.len(),
            self.spec.analysis.is_some(),
        ));
        info!(pipeline = %self.spec.name, trigger = %trigger, cells = cells.len(), "pipeline started");

        let analysis_job = self.spec.analysis.clone().map(|spec| {
            AnalysisJob::new(
                spec,
                step_runner.clone(),
                pipeline_env.clone(),
                self.workspace.clone(),
                run_dir.join("analysis"),
            )
            .with_progress(self.events.clone())
        });

        let matrix = scheduler.run(cells, move |cell, cancel| {
            let runner = cell_runner.clone();
            async move { runner.run(cell, cancel).await }
        });
        let analysis = async {
            match &analysis_job {
                Some(job) => Some(job.run().await),
                None => None,
            }
        };
        let (matrix, analysis) = tokio::join!(matrix, analysis);

        if !self.config.keep_work_dirs {
            if let Err(e) = fs::remove_dir_all(&run_dir) {
                warn!(dir = %run_dir.display(), error = %e, "could not remove run directory");
            }
        }

        let report = PipelineReport {
            pipeline: self.spec.name.clone(),
            trigger,
            coverage_forwarded_from: matrix
                .cells
                .iter()
                .find(|c| c.coverage_forwarded)
                .map(|c| c.cell.clone()),
            cells: matrix.cells,
            analysis,
            duration: started.elapsed(),
        };

        info!(pipeline = %report.pipeline, success = report.success(), duration = ?report.duration, "pipeline finished");
        self.events.send_event(ExecutionEvent::pipeline_completed(
            &report.pipeline,
            report.success(),
            report.duration,
        ));
        Ok(PipelineOutcome::Completed(report))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    fn backend(&self) -> Arc<dyn ServiceBackend> {
        match &self.backend {
            Some(backend) => backend.clone(),
            None => Arc::new(DockerBackend::with_binary(&self.config.container_binary)),
        }
    }

    fn installer(
        &self,
        shell: &ShellRunner,
        pipeline_env: &Arc<std::collections::BTreeMap<String, String>>,
    ) -> Arc<dyn DependencyInstaller> {
        if let Some(installer) = &self.installer {
            return installer.clone();
        }
        match &self.spec.install {
            Some(template) => Arc::new(ShellInstaller::new(
                shell.clone(),
                template.clone(),
                pipeline_env.clone(),
            )),
            None => Arc::new(NoopInstaller),
        }
    }

    fn sink(&self, shell: &ShellRunner) -> Arc<dyn ReportingSink> {
        if let Some(sink) = &self.sink {
            return sink.clone();
        }
        match &self.spec.report {
            Some(ReportSinkSpec::File { path }) => Arc::new(FileSink::new(self.resolve(path))),
            Some(ReportSinkSpec::Command { run }) => {
                let env: HashMap<String, String> = self
                    .spec
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Arc::new(CommandSink::new(
                    shell.clone(),
                    run.clone(),
                    self.workspace.clone(),
                    env,
                ))
            }
            None => Arc::new(NullSink),
        }
    }
}

fn run_dir_name(pipeline: &str) -> String {
    let name: String = pipeline
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{}-{:x}", name, std::process::id(), nanos)
}
