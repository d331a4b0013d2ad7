// Run Reporter
// Renders a finished pipeline run as JSON or as a terminal summary

use crate::error::EngineResult;
use crate::execution::cell::{CellResult, CellStatus};
use crate::execution::pipeline::PipelineReport;

use serde::Serializer;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Lines of captured output shown for a failed cell
const OUTPUT_TAIL_LINES: usize = 20;

/// Serialize a duration as whole milliseconds
pub fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
}

/// Output format for run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Terminal,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Json => write!(f, "json"),
            ReportFormat::Terminal => write!(f, "terminal"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "terminal" | "text" | "console" => Ok(ReportFormat::Terminal),
            _ => Err(format!(
                "Unknown report format '{}'. Valid formats: json, terminal",
                s
            )),
        }
    }
}

pub struct RunReporter;

impl RunReporter {
    pub fn report(report: &PipelineReport, format: ReportFormat) -> EngineResult<String> {
        match format {
            ReportFormat::Json => Self::to_json(report),
            ReportFormat::Terminal => Ok(Self::to_terminal(report)),
        }
    }

    pub fn to_json(report: &PipelineReport) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(report)?)
    }

    /// Write the JSON report, creating parent directories
    pub fn write_json(report: &PipelineReport, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, Self::to_json(report)?)?;
        Ok(())
    }

    /// Human-readable summary: one block per cell, failures with output tail
    pub fn to_terminal(report: &PipelineReport) -> String {
        let mut out = String::new();

        out.push_str(&format!("\nPipeline: {} ({})\n", report.pipeline, report.trigger));
        out.push_str(&"=".repeat(60));
        out.push('\n');

        for cell in &report.cells {
            render_cell(&mut out, cell);
        }
        if let Some(analysis) = &report.analysis {
            render_cell(&mut out, analysis);
        }

        out.push_str(&"-".repeat(60));
        out.push('\n');

        let failed = report.cells.iter().filter(|c| c.status == CellStatus::Failed).count();
        let not_started = report
            .cells
            .iter()
            .filter(|c| c.status == CellStatus::NotStarted)
            .count();
        out.push_str(&format!(
            "Cells: {} total, {} passed, {} failed, {} not started\n",
            report.cells.len(),
            report.cells.len() - failed - not_started,
            failed,
            not_started
        ));
        match &report.coverage_forwarded_from {
            Some(cell) => out.push_str(&format!("Coverage: forwarded from {}\n", cell)),
            None => out.push_str("Coverage: not forwarded\n"),
        }
        out.push_str(&format!(
            "Result: {} ({:.2}s)\n",
            if report.success() { "SUCCESS" } else { "FAILED" },
            report.duration.as_secs_f64()
        ));

        out
    }
}

fn render_cell(out: &mut String, cell: &CellResult) {
    let symbol = match cell.status {
        CellStatus::Succeeded => "+",
        CellStatus::Failed => "x",
        CellStatus::NotStarted => "-",
    };
    let cache = match cell.cache_hit {
        Some(true) => " [cache hit]",
        Some(false) => " [cache miss]",
        None => "",
    };
    out.push_str(&format!(
        "  [{}] {} {} ({:.2}s){}\n",
        symbol,
        cell.cell,
        cell.status,
        cell.duration.as_secs_f64(),
        cache
    ));

    for step in &cell.steps {
        out.push_str(&format!(
            "      {:<9} {} ({:.2}s)\n",
            format!("{:?}", step.status).to_lowercase(),
            step.name,
            step.duration.as_secs_f64()
        ));
    }

    let Some(failure) = &cell.failure else {
        return;
    };
    out.push_str(&format!("      error: {}\n", failure.message));
    if let Some(output) = failure.output.as_deref().filter(|o| !o.trim().is_empty()) {
        for line in tail(output, OUTPUT_TAIL_LINES) {
            out.push_str(&format!("        | {}\n", line));
        }
    }
}

fn tail(output: &str, lines: usize) -> impl Iterator<Item = &str> {
    let all: Vec<&str> = output.lines().collect();
    let skip = all.len().saturating_sub(lines);
    all.into_iter().skip(skip)
}
