// Coverage Aggregation
// Merges per-step coverage fragments and forwards one report per run to the sink

use crate::error::{EngineError, EngineResult};
use crate::execution::cell::CellId;
use crate::runners::{Script, ShellRunner};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Hit counts of one source file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCoverage {
    /// line number -> hits
    #[serde(default)]
    pub lines: BTreeMap<u32, u64>,
    /// "line:branch" -> hits
    #[serde(default)]
    pub branches: BTreeMap<String, u64>,
}

impl FileCoverage {
    fn merge(&mut self, other: &FileCoverage) {
        for (line, hits) in &other.lines {
            let slot = self.lines.entry(*line).or_insert(0);
            *slot = (*slot).max(*hits);
        }
        for (branch, hits) in &other.branches {
            let slot = self.branches.entry(branch.clone()).or_insert(0);
            *slot = (*slot).max(*hits);
        }
    }
}

/// Coverage data: the fragment a step writes and the merged report share a format
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    #[serde(default)]
    pub files: BTreeMap<String, FileCoverage>,
}

/// Coverage output of a single step
pub type CoverageFragment = CoverageReport;

impl CoverageReport {
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let content = fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Union with `other`; a line keeps the larger hit count
    pub fn merge(&mut self, other: &CoverageReport) {
        for (path, coverage) in &other.files {
            self.files.entry(path.clone()).or_default().merge(coverage);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_lines(&self) -> usize {
        self.files.values().map(|f| f.lines.len()).sum()
    }

    pub fn covered_lines(&self) -> usize {
        self.files
            .values()
            .map(|f| f.lines.values().filter(|hits| **hits > 0).count())
            .sum()
    }

    /// Covered share of lines, 0.0 when nothing was measured
    pub fn line_rate(&self) -> f64 {
        match self.total_lines() {
            0 => 0.0,
            total => self.covered_lines() as f64 / total as f64,
        }
    }

    pub fn summary(&self) -> CoverageSummary {
        CoverageSummary {
            files: self.files.len(),
            covered_lines: self.covered_lines(),
            total_lines: self.total_lines(),
        }
    }
}

/// Counts shown in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub files: usize,
    pub covered_lines: usize,
    pub total_lines: usize,
}

/// Accumulates a cell's fragments in step order
#[derive(Debug, Default)]
pub struct CoverageAggregator {
    report: CoverageReport,
    fragments: usize,
}

impl CoverageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step's fragment; without `append` it replaces what came before
    pub fn add(&mut self, fragment: &CoverageFragment, append: bool) {
        if append {
            self.report.merge(fragment);
        } else {
            self.report = fragment.clone();
        }
        self.fragments += 1;
    }

    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// The merged report, or `None` if no step produced coverage
    pub fn finish(self) -> Option<CoverageReport> {
        (self.fragments > 0).then_some(self.report)
    }
}

/// Destination of the designated cell's coverage report
#[async_trait]
pub trait ReportingSink: Send + Sync {
    /// Short description for logs and events
    fn describe(&self) -> String;

    async fn send(&self, report: &CoverageReport) -> EngineResult<()>;
}

/// Writes the report as JSON to a file
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ReportingSink for FileSink {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn send(&self, report: &CoverageReport) -> EngineResult<()> {
        let unreachable =
            |e: &dyn std::fmt::Display| EngineError::ReportingSinkUnreachable(format!("{}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| unreachable(&e))?;
        }
        let json = serde_json::to_vec_pretty(report)?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| unreachable(&e))
    }
}

/// Pipes the report as JSON into an uploader command
pub struct CommandSink {
    runner: ShellRunner,
    command: String,
    workspace: PathBuf,
    env: HashMap<String, String>,
}

impl CommandSink {
    pub fn new(
        runner: ShellRunner,
        command: impl Into<String>,
        workspace: impl Into<PathBuf>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            runner,
            command: command.into(),
            workspace: workspace.into(),
            env,
        }
    }
}

#[async_trait]
impl ReportingSink for CommandSink {
    fn describe(&self) -> String {
        format!("command `{}`", self.command)
    }

    async fn send(&self, report: &CoverageReport) -> EngineResult<()> {
        let payload = serde_json::to_vec(report)?;
        let output = self
            .runner
            .run(
                Script::new(&self.command, &self.workspace)
                    .env(&self.env)
                    .stdin(payload),
            )
            .await;

        if output.success() {
            return Ok(());
        }
        Err(EngineError::ReportingSinkUnreachable(format!(
            "`{}` exited with {:?}: {}",
            self.command,
            output.exit_code,
            output.stderr.trim()
        )))
    }
}

/// Accepts and discards reports
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl ReportingSink for NullSink {
    fn describe(&self) -> String {
        "none".to_string()
    }

    async fn send(&self, _report: &CoverageReport) -> EngineResult<()> {
        Ok(())
    }
}

/// What happened to a cell's report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The cell's version is not the report version
    NotDesignated,
    /// Another cell already forwarded this run
    AlreadyForwarded,
    Forwarded,
    /// The sink failed; the run is unaffected
    SinkUnreachable(String),
}

/// Lets exactly one cell per run, the report-version cell, reach the sink
pub struct CoverageForwarder {
    report_version: Option<String>,
    sink: Arc<dyn ReportingSink>,
    claimed: AtomicBool,
}

impl CoverageForwarder {
    pub fn new(report_version: Option<String>, sink: Arc<dyn ReportingSink>) -> Self {
        Self {
            report_version,
            sink,
            claimed: AtomicBool::new(false),
        }
    }

    pub fn sink_description(&self) -> String {
        self.sink.describe()
    }

    pub fn is_designated(&self, cell: &CellId) -> bool {
        match (&cell.version, &self.report_version) {
            (Some(version), Some(report)) => version == report,
            _ => false,
        }
    }

    pub async fn offer(&self, cell: &CellId, report: &CoverageReport) -> ForwardOutcome {
        if !self.is_designated(cell) {
            return ForwardOutcome::NotDesignated;
        }
        if self.claimed.swap(true, Ordering::SeqCst) {
            return ForwardOutcome::AlreadyForwarded;
        }

        match self.sink.send(report).await {
            Ok(()) => {
                info!(cell = %cell, sink = %self.sink.describe(), files = report.files.len(), "coverage report forwarded");
                ForwardOutcome::Forwarded
            }
            Err(e) => {
                warn!(cell = %cell, sink = %self.sink.describe(), error = %e, "coverage report not delivered");
                ForwardOutcome::SinkUnreachable(e.to_string())
            }
        }
    }
}
