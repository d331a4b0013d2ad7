// Workflow Module
// Pipeline definitions: model, loading, triggers and command templates

pub mod models;
pub mod parser;
pub mod template;
pub mod trigger;

pub use models::{
    AnalysisSpec, ConditionContext, FailFastScope, MatrixSpec, PipelineSpec, PortMapping,
    ReportSinkSpec, RunCondition, ServiceSpec, StepSpec,
};
pub use parser::PipelineParser;
pub use template::{render, TemplateScope};
pub use trigger::{first_match, TriggerEvent, TriggerRule};
