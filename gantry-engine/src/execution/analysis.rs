// Analysis Job
// Single-cell static checks running alongside the matrix

use crate::execution::cell::{CellId, CellResult};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::step_runner::{CancelSignal, StepContext, StepRunner};
use crate::workflow::models::AnalysisSpec;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Runs the analysis steps once, without services, matrix or cache
pub struct AnalysisJob {
    spec: AnalysisSpec,
    steps: StepRunner,
    pipeline_env: Arc<BTreeMap<String, String>>,
    workspace: PathBuf,
    cell_dir: PathBuf,
    events: Option<ProgressSender>,
}

impl AnalysisJob {
    pub fn new(
        spec: AnalysisSpec,
        steps: StepRunner,
        pipeline_env: Arc<BTreeMap<String, String>>,
        workspace: impl Into<PathBuf>,
        cell_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            spec,
            steps,
            pipeline_env,
            workspace: workspace.into(),
            cell_dir: cell_dir.into(),
            events: None,
        }
    }

    pub fn with_progress(mut self, events: Option<ProgressSender>) -> Self {
        self.events = events;
        self
    }

    pub fn cell_id(&self) -> CellId {
        CellId::single(self.spec.name.clone())
    }

    #[instrument(skip_all, fields(job = %self.spec.name))]
    pub async fn run(&self) -> CellResult {
        let started = Instant::now();
        let cell = self.cell_id();
        let mut result = CellResult::new(cell.clone());

        self.events.send_event(ExecutionEvent::CellStarted {
            cell: cell.clone(),
            total_steps: self.spec.steps.len(),
        });

        if let Err(e) = fs::create_dir_all(&self.cell_dir) {
            warn!(error = %e, dir = %self.cell_dir.display(), "could not create analysis directory");
        }

        let cell_env = HashMap::new();
        let ctx = StepContext {
            cell: &cell,
            report_version: None,
            pipeline_env: &self.pipeline_env,
            cell_env: &cell_env,
            workspace: &self.workspace,
            cell_dir: &self.cell_dir,
        };
        let run = self.steps.run(&self.spec.steps, &ctx, &CancelSignal::new()).await;
        result.apply_steps(run);
        result.duration = started.elapsed();

        info!(status = %result.status, "analysis finished");
        self.events.send_event(ExecutionEvent::CellCompleted {
            cell,
            status: result.status,
            duration: result.duration,
        });
        result
    }
}
