use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use gantry_engine::workflow::RunCondition;
use gantry_engine::PipelineParser;

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    output::status("Validating", &format!("{}", pipeline_path.display()));

    let spec = match PipelineParser::from_file(pipeline_path) {
        Ok(spec) => spec,
        Err(e) => {
            output::error(&format!("Parse error: {}", e));
            std::process::exit(1);
        }
    };
    output::check("YAML syntax valid");

    if let Err(e) = PipelineParser::validate(&spec) {
        output::error(&e.to_string());
        std::process::exit(1);
    }
    output::check("Semantic validation passed");

    println!();
    println!("  Pipeline: {}", spec.name);
    println!(
        "  Matrix:   {} (fail-fast: {}, scope: {:?}{})",
        spec.matrix.versions.join(", "),
        spec.matrix.fail_fast,
        spec.matrix.fail_fast_scope,
        spec.matrix
            .max_parallel
            .map(|n| format!(", max parallel: {}", n))
            .unwrap_or_default()
    );
    match spec.report_version() {
        Some(version) => println!("  Coverage: reported from {}", version),
        None => println!("  Coverage: not reported"),
    }
    if let Some(lockfile) = &spec.lockfile {
        println!("  Lockfile: {}", lockfile.display());
    }

    if !spec.services.is_empty() {
        println!("  Services:");
        for service in &spec.services {
            println!(
                "    {} ({}) ports: {}",
                service.name,
                service.image,
                service.ports.join(", ")
            );
        }
    }

    println!("  Steps:");
    for (i, step) in spec.steps.iter().enumerate() {
        let condition = match &step.condition {
            None | Some(RunCondition::Always) => String::new(),
            Some(condition) => format!(" [if {:?}]", condition),
        };
        println!("    {}. {}{}", i + 1, step.name, condition);
    }

    if let Some(analysis) = &spec.analysis {
        println!("  Analysis '{}': {} steps", analysis.name, analysis.steps.len());
    }

    println!();
    output::success("Pipeline is valid");
    Ok(())
}
