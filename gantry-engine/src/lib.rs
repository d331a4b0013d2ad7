// Gantry Engine Library
// CI orchestration: version matrix, ephemeral services, cached environments, coverage

pub mod cache;
pub mod config;
pub mod environment;
pub mod error;
pub mod execution;
pub mod runners;
pub mod services;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, FailureKind};

// Re-export workflow types
pub use workflow::{PipelineParser, PipelineSpec, TriggerEvent, TriggerRule};

// Re-export execution types
pub use execution::{
    progress_channel, CellId, CellResult, CellStatus, ExecutionEvent, PipelineOutcome,
    PipelineReport, PipelineRunner, ProgressSender, ReportFormat, RunReporter,
};

// Re-export building blocks
pub use cache::{CacheEntry, CacheKey, CacheStore};
pub use environment::{DependencyInstaller, EnvironmentBuilder};
pub use runners::ShellRunner;
pub use services::{DockerBackend, ServiceBackend, ServiceProvisioner};
