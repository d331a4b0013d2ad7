// Execution Events
// What a run reports while it is in flight: pipeline, cell and step lifecycle

use crate::execution::cell::{CellId, CellStatus};
use crate::execution::step_runner::StepStatus;

use std::time::Duration;
use tokio::sync::mpsc;

pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Unbounded, so a slow consumer never stalls a step's output reader
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        pipeline_name: String,
        trigger: String,
        total_cells: usize,
        has_analysis: bool,
    },
    PipelineNotTriggered {
        pipeline_name: String,
        trigger: String,
    },
    PipelineCompleted {
        pipeline_name: String,
        success: bool,
        duration: Duration,
    },

    CellStarted {
        cell: CellId,
        total_steps: usize,
    },
    /// Fail-fast tripped before this cell got a slot
    CellSkipped {
        cell: CellId,
        reason: String,
    },
    /// Every service of the cell passed its readiness probe
    ServicesReady {
        cell: CellId,
        services: Vec<String>,
    },
    EnvironmentResolved {
        cell: CellId,
        cache_key: String,
        cache_hit: bool,
    },
    CellCompleted {
        cell: CellId,
        status: CellStatus,
        duration: Duration,
    },

    StepStarted {
        cell: CellId,
        step_name: String,
        step_index: usize,
    },
    /// One line of step output; `is_error` marks stderr
    StepOutput {
        cell: CellId,
        step_index: usize,
        output: String,
        is_error: bool,
    },
    StepCompleted {
        cell: CellId,
        step_name: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },
    /// The step's `if` condition did not hold, or an earlier step failed
    StepSkipped {
        cell: CellId,
        step_name: String,
        step_index: usize,
        reason: String,
    },

    /// Sent at most once per run, by the designated cell
    CoverageForwarded {
        cell: CellId,
        sink: String,
        files: usize,
    },

    Log {
        level: LogLevel,
        message: String,
        cell: Option<CellId>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn pipeline_started(
        name: impl Into<String>,
        trigger: impl Into<String>,
        total_cells: usize,
        has_analysis: bool,
    ) -> Self {
        Self::PipelineStarted {
            pipeline_name: name.into(),
            trigger: trigger.into(),
            total_cells,
            has_analysis,
        }
    }

    pub fn pipeline_completed(name: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::PipelineCompleted {
            pipeline_name: name.into(),
            success,
            duration,
        }
    }

    pub fn step_started(cell: &CellId, step_name: &str, step_index: usize) -> Self {
        Self::StepStarted {
            cell: cell.clone(),
            step_name: step_name.to_string(),
            step_index,
        }
    }

    pub fn step_output(cell: &CellId, step_index: usize, line: &str, is_error: bool) -> Self {
        Self::StepOutput {
            cell: cell.clone(),
            step_index,
            output: line.to_string(),
            is_error,
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>, cell: Option<CellId>) -> Self {
        Self::Log {
            level,
            message: message.into(),
            cell,
        }
    }

    pub fn warning(message: impl Into<String>, cell: Option<CellId>) -> Self {
        Self::log(LogLevel::Warning, message, cell)
    }

    /// `None` for pipeline-level events and cell-less log lines
    pub fn cell(&self) -> Option<&CellId> {
        use ExecutionEvent::*;
        match self {
            PipelineStarted { .. } | PipelineNotTriggered { .. } | PipelineCompleted { .. } => None,
            Log { cell, .. } => cell.as_ref(),
            CellStarted { cell, .. }
            | CellSkipped { cell, .. }
            | ServicesReady { cell, .. }
            | EnvironmentResolved { cell, .. }
            | CellCompleted { cell, .. }
            | StepStarted { cell, .. }
            | StepOutput { cell, .. }
            | StepCompleted { cell, .. }
            | StepSkipped { cell, .. }
            | CoverageForwarded { cell, .. } => Some(cell),
        }
    }
}

/// Delivery that never fails the sender: a dropped receiver just loses events
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(tx) = self {
            tx.send_event(event);
        }
    }
}
