use crate::commands::{ConfigArgs, EventArgs};
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use gantry_engine::execution::{CellStatus, LogLevel, StepStatus};
use gantry_engine::{
    progress_channel, ExecutionEvent, PipelineOutcome, PipelineParser, PipelineRunner,
    RunReporter,
};

/// Run a pipeline locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[command(flatten)]
    pub event: EventArgs,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Maximum number of matrix cells running at once
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Keep running the other cells when one fails
    #[arg(long)]
    pub no_fail_fast: bool,

    /// Write the final report as JSON
    #[arg(long, value_name = "FILE")]
    pub report_json: Option<PathBuf>,

    /// Workspace directory steps run in (default: current directory)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Keep per-cell working directories after the run
    #[arg(long)]
    pub keep_work_dirs: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    output::status("Loading", &format!("{}", pipeline_path.display()));
    let spec = PipelineParser::load(pipeline_path)
        .map_err(|e| color_eyre::eyre::eyre!("Invalid pipeline: {}", e))?;

    let mut config = args.config.load()?;
    if args.keep_work_dirs {
        config.keep_work_dirs = true;
    }

    let workspace = match &args.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    output::info(&format!(
        "Pipeline '{}': {} versions, {} services, {} steps",
        spec.name,
        spec.matrix.versions.len(),
        spec.services.len(),
        spec.steps.len()
    ));

    let (tx, rx) = progress_channel();
    let mut runner = PipelineRunner::new(spec, config)
        .with_workspace(workspace)
        .with_progress(tx);
    if let Some(n) = args.max_parallel {
        runner = runner.with_max_parallel(n);
    }
    if args.no_fail_fast {
        runner = runner.with_fail_fast(false);
    }

    let event = args.event.event();
    debug!(pipeline = %pipeline_path.display(), trigger = %event, "starting run");
    let run_handle = tokio::spawn(async move { runner.run(&event).await });

    let mut events = UnboundedReceiverStream::new(rx);
    while let Some(event) = events.next().await {
        print_event(&event);
    }

    let outcome = run_handle.await??;

    let report = match &outcome {
        PipelineOutcome::NotTriggered { trigger } => {
            output::warning(&format!("Not triggered by {}; nothing to do", trigger));
            return Ok(());
        }
        PipelineOutcome::Completed(report) => report,
    };

    eprint!("{}", RunReporter::to_terminal(report));

    if let Some(path) = &args.report_json {
        RunReporter::write_json(report, path)?;
        output::status("Wrote", &format!("{}", path.display()));
    }

    let code = outcome.exit_code();
    info!(pipeline = %report.pipeline, exit_code = code, "run finished");
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_name,
            trigger,
            total_cells,
            has_analysis,
        } => {
            println!();
            output::header(&format!(
                "Pipeline '{}' on {} ({} cells{})",
                pipeline_name,
                trigger,
                total_cells,
                if *has_analysis { " + analysis" } else { "" }
            ));
        }

        ExecutionEvent::PipelineNotTriggered { .. } => {}

        ExecutionEvent::PipelineCompleted {
            success, duration, ..
        } => {
            println!();
            if *success {
                output::success(&format!(
                    "Pipeline completed successfully in {:.2}s",
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!(
                    "Pipeline failed after {:.2}s",
                    duration.as_secs_f64()
                ));
            }
        }

        ExecutionEvent::CellStarted { cell, total_steps } => {
            output::cell_header(&cell.to_string(), *total_steps);
        }

        ExecutionEvent::CellSkipped { cell, reason } => {
            output::warning(&format!("  {} not started: {}", cell, reason));
        }

        ExecutionEvent::ServicesReady { cell, services } => {
            output::dim(&format!("  [{}] services ready: {}", cell, services.join(", ")));
        }

        ExecutionEvent::EnvironmentResolved {
            cell,
            cache_key,
            cache_hit,
        } => {
            let state = if *cache_hit { "hit" } else { "miss" };
            output::dim(&format!("  [{}] cache {} ({})", cell, state, cache_key));
        }

        ExecutionEvent::StepStarted {
            cell,
            step_name,
            step_index,
        } => {
            println!("  [{}] Step {}: {}", cell, step_index + 1, step_name);
        }

        ExecutionEvent::StepOutput {
            cell,
            output,
            is_error,
            ..
        } => {
            let label = cell.to_string();
            for line in output.lines() {
                if *is_error {
                    output::step_error(&label, line);
                } else {
                    output::step_output(&label, line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            cell,
            step_name,
            status,
            duration,
            exit_code,
            ..
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "  [{}] {} {:?} ({:.2}s){}",
                cell,
                step_name,
                status,
                duration.as_secs_f64(),
                exit_info
            );
            match status {
                StepStatus::Succeeded => output::dim_success(&line),
                StepStatus::Failed => output::dim_failure(&line),
                _ => output::dim(&line),
            }
        }

        ExecutionEvent::StepSkipped {
            cell,
            step_name,
            reason,
            ..
        } => {
            output::dim(&format!("  [{}] {} skipped: {}", cell, step_name, reason));
        }

        ExecutionEvent::CellCompleted {
            cell,
            status,
            duration,
        } => {
            let line = format!("  Cell {} {} ({:.2}s)", cell, status, duration.as_secs_f64());
            if *status == CellStatus::Succeeded {
                output::dim_success(&line);
            } else {
                output::dim_failure(&line);
            }
        }

        ExecutionEvent::CoverageForwarded { cell, sink, files } => {
            output::check(&format!(
                "Coverage from {} ({} files) sent to {}",
                cell, files, sink
            ));
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            _ => output::dim(message),
        },
    }
}
