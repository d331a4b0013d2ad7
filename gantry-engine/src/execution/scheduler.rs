// Matrix Scheduler
// Expands the version matrix into cells and runs them with bounded parallelism

use crate::cache::CacheKey;
use crate::error::EngineError;
use crate::execution::cell::{CellId, CellResult, MatrixCell};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::step_runner::CancelSignal;
use crate::workflow::models::{FailFastScope, PipelineSpec};

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Job name of matrix cells
pub const TEST_JOB: &str = "test";

/// Results of a matrix run, in matrix order
#[derive(Debug, Clone)]
pub struct MatrixOutcome {
    pub cells: Vec<CellResult>,
}

impl MatrixOutcome {
    /// Every cell succeeded
    pub fn success(&self) -> bool {
        self.cells.iter().all(CellResult::succeeded)
    }

    pub fn failed_cells(&self) -> impl Iterator<Item = &CellResult> {
        self.cells.iter().filter(|c| !c.succeeded())
    }
}

/// Runs matrix cells concurrently
#[derive(Debug, Clone)]
pub struct MatrixScheduler {
    max_parallel: Option<usize>,
    fail_fast: bool,
    scope: FailFastScope,
    events: Option<ProgressSender>,
}

impl MatrixScheduler {
    pub fn new(fail_fast: bool, scope: FailFastScope) -> Self {
        Self {
            max_parallel: None,
            fail_fast,
            scope,
            events: None,
        }
    }

    /// Scheduler configured from the pipeline's matrix section
    pub fn for_pipeline(spec: &PipelineSpec) -> Self {
        Self::new(spec.matrix.fail_fast, spec.matrix.fail_fast_scope)
            .with_max_parallel(spec.matrix.max_parallel)
    }

    /// Cap concurrently running cells (None = matrix size)
    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_progress(mut self, events: ProgressSender) -> Self {
        self.events = Some(events);
        self
    }

    /// One cell per version, in matrix order
    pub fn expand(spec: &PipelineSpec, lockfile_hash: &str) -> Vec<MatrixCell> {
        spec.matrix
            .versions
            .iter()
            .enumerate()
            .map(|(index, version)| MatrixCell {
                id: CellId::matrix(TEST_JOB, version.clone()),
                index,
                cache_key: CacheKey::new(version.clone(), lockfile_hash),
            })
            .collect()
    }

    fn parallelism(&self, cells: usize) -> usize {
        self.max_parallel.unwrap_or(cells).clamp(1, cells.max(1))
    }

    /// Run every cell through `run_cell`.
    ///
    /// Cells are launched in matrix order as permits free up. Once a cell fails
    /// with fail-fast on, cells still waiting for a permit are recorded as not
    /// started. With [`FailFastScope::Steps`] running cells also receive the
    /// cancel signal. A panicking cell counts as a failed cell.
    pub async fn run<F, Fut>(&self, cells: Vec<MatrixCell>, run_cell: F) -> MatrixOutcome
    where
        F: Fn(MatrixCell, CancelSignal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CellResult> + Send + 'static,
    {
        let limit = self.parallelism(cells.len());
        let semaphore = Arc::new(Semaphore::new(limit));
        let failing = CancelSignal::new();
        let run_cell = Arc::new(run_cell);
        let ids: Vec<CellId> = cells.iter().map(|c| c.id.clone()).collect();
        let mut results: Vec<Option<CellResult>> = vec![None; cells.len()];
        let mut set = JoinSet::new();

        info!(cells = cells.len(), parallelism = limit, fail_fast = self.fail_fast, "running matrix");

        for (index, cell) in cells.into_iter().enumerate() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    results[index] = Some(self.not_started(cell.id, "scheduler closed"));
                    continue;
                }
            };

            if self.fail_fast && failing.is_canceled() {
                drop(permit);
                results[index] = Some(self.not_started(cell.id, "fail-fast: another cell failed"));
                continue;
            }

            let cancel = match self.scope {
                FailFastScope::Steps => failing.clone(),
                FailFastScope::Cells => CancelSignal::new(),
            };
            let failing = failing.clone();
            let fail_fast = self.fail_fast;
            let run_cell = run_cell.clone();
            let id = cell.id.clone();

            set.spawn(async move {
                // Inner task so a panic becomes a failed cell instead of a lost one.
                let result = match tokio::spawn((*run_cell)(cell, cancel)).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(cell = %id, error = %e, "cell task did not complete");
                        CellResult::failed(
                            id,
                            &EngineError::Internal(format!("cell task did not complete: {}", e)),
                        )
                    }
                };
                if fail_fast && !result.succeeded() {
                    failing.cancel();
                }
                drop(permit);
                (index, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    debug!(cell = %result.cell, status = %result.status, "cell collected");
                    results[index] = Some(result);
                }
                Err(e) => error!(error = %e, "matrix task failed"),
            }
        }

        let cells = results
            .into_iter()
            .zip(ids)
            .map(|(result, id)| {
                result.unwrap_or_else(|| {
                    CellResult::failed(
                        id,
                        &EngineError::Internal("cell result was lost".to_string()),
                    )
                })
            })
            .collect();

        MatrixOutcome { cells }
    }

    fn not_started(&self, cell: CellId, reason: &str) -> CellResult {
        info!(cell = %cell, reason, "cell not started");
        self.events.send_event(ExecutionEvent::CellSkipped {
            cell: cell.clone(),
            reason: reason.to_string(),
        });
        CellResult::not_started(cell)
    }
}
