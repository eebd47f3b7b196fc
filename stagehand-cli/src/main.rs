// Stagehand CLI
// Plans, validates and runs staged pipelines locally

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::artifacts::ArtifactsCommand;
use commands::plan::PlanArgs;
use commands::run::RunArgs;
use commands::validate::ValidateArgs;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(version, about = "Run GitLab-style staged pipelines locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run(RunArgs),
    /// Show what a pipeline would run for a trigger
    Plan(PlanArgs),
    /// Validate a pipeline file
    Validate(ValidateArgs),
    /// Manage stored artifacts
    #[command(subcommand)]
    Artifacts(ArtifactsCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // RUST_LOG=stagehand_engine=debug shows engine internals
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Plan(args) => commands::plan::execute(args),
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Artifacts(command) => commands::artifacts::execute(command).await,
    }
}
