mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

/// Run matrix CI pipelines locally with ephemeral services and dependency caching
#[derive(Parser, Debug)]
#[command(name = "gantry", author, version, about)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline
    Run(commands::run::RunArgs),

    /// Validate a pipeline file
    Validate(commands::validate::ValidateArgs),

    /// Manage the dependency cache
    Cache(commands::cache::CacheArgs),

    /// Check whether an event would trigger a pipeline
    Trigger(commands::trigger::TriggerArgs),
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
        Command::Cache(args) => commands::cache::execute(args).await,
        Command::Trigger(args) => commands::trigger::execute(args),
    }
}
