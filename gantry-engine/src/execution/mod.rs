// Execution Module
// Matrix scheduling, per-cell orchestration, steps, coverage and reporting

pub mod analysis;
pub mod cell;
pub mod coverage;
pub mod events;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod step_runner;

// Re-export key types
pub use analysis::AnalysisJob;
pub use cell::{CellFailure, CellId, CellResult, CellStatus, MatrixCell};
pub use coverage::{
    CommandSink, CoverageAggregator, CoverageForwarder, CoverageFragment, CoverageReport,
    CoverageSummary, FileCoverage, FileSink, ForwardOutcome, NullSink, ReportingSink,
};
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use pipeline::{PipelineOutcome, PipelineReport, PipelineRunner};
pub use report::{ReportFormat, RunReporter};
pub use scheduler::{MatrixOutcome, MatrixScheduler};
pub use step_runner::{CancelSignal, StepResult, StepRun, StepRunner, StepStatus};
