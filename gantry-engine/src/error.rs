// Engine Errors
// Error kinds surfaced by provisioning, caching, installation, steps and reporting

use crate::services::docker::ContainerError;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors produced by the orchestration engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Service '{service}' unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("Cache write conflict for {key}: {reason}")]
    CacheWriteConflict { key: String, reason: String },

    #[error("Dependency install failed for version {version} (exit code: {exit_code:?})")]
    DependencyInstallFailed {
        version: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Step '{step}' failed (exit code: {exit_code:?})")]
    StepFailed {
        step: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Reporting sink unreachable: {0}")]
    ReportingSinkUnreachable(String),

    #[error("Invalid pipeline: {0}")]
    InvalidInput(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias used across the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse classification of an [`EngineError`], kept on cell results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ServiceUnavailable,
    CacheWriteConflict,
    DependencyInstallFailed,
    StepFailed,
    ReportingSinkUnreachable,
    /// Stopped by matrix fail-fast
    Canceled,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::ServiceUnavailable => "service unavailable",
            FailureKind::CacheWriteConflict => "cache write conflict",
            FailureKind::DependencyInstallFailed => "dependency install failed",
            FailureKind::StepFailed => "step failed",
            FailureKind::ReportingSinkUnreachable => "reporting sink unreachable",
            FailureKind::Canceled => "canceled",
            FailureKind::Internal => "internal error",
        };
        f.write_str(label)
    }
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::ServiceUnavailable { .. } => FailureKind::ServiceUnavailable,
            EngineError::CacheWriteConflict { .. } => FailureKind::CacheWriteConflict,
            EngineError::DependencyInstallFailed { .. } => FailureKind::DependencyInstallFailed,
            EngineError::StepFailed { .. } => FailureKind::StepFailed,
            EngineError::ReportingSinkUnreachable(_) => FailureKind::ReportingSinkUnreachable,
            _ => FailureKind::Internal,
        }
    }

    /// Whether this error ends the cell it occurred in.
    ///
    /// Everything except an unreachable reporting sink is fatal to the cell.
    pub fn is_fatal_to_cell(&self) -> bool {
        !matches!(self, EngineError::ReportingSinkUnreachable(_))
    }

    /// Captured process output attached to the error, if any
    pub fn captured_output(&self) -> Option<String> {
        match self {
            EngineError::DependencyInstallFailed { output, .. } => Some(output.clone()),
            EngineError::StepFailed { stdout, stderr, .. } => {
                let mut combined = stdout.clone();
                if !stderr.is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str(stderr);
                }
                Some(combined)
            }
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            EngineError::DependencyInstallFailed { exit_code, .. }
            | EngineError::StepFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}
