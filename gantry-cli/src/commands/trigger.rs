use crate::commands::EventArgs;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use gantry_engine::workflow::first_match;
use gantry_engine::PipelineParser;

/// Check whether an event would start a pipeline
#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    #[command(flatten)]
    pub event: EventArgs,
}

pub fn execute(args: TriggerArgs) -> Result<()> {
    let spec = PipelineParser::from_file(&args.pipeline)
        .map_err(|e| color_eyre::eyre::eyre!("Parse error: {}", e))?;
    let event = args.event.event();

    match first_match(&spec.triggers, &event) {
        Some(index) => {
            output::success(&format!(
                "'{}' runs on {} (rule {}: {:?})",
                spec.name,
                event,
                index + 1,
                spec.triggers[index]
            ));
        }
        None => {
            output::failure(&format!("'{}' does not run on {}", spec.name, event));
            std::process::exit(1);
        }
    }
    Ok(())
}
