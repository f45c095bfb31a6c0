use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "checkgate")]
#[command(
    version,
    about = "Workload lifecycle controller that gates deployments on check tasks"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file. Defaults to ./checkgate.toml when present.
    #[arg(long, global = true, env = "CHECKGATE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Drive workload manifests through their checks against an in-memory store
    Simulate(SimulateArgs),
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration as TOML
    Show,
    /// Validate configuration; exits non-zero on errors
    Validate,
    /// Write a default checkgate.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Scripted outcome for simulated check tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Outcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Args, Clone, Debug)]
pub struct SimulateArgs {
    /// WorkloadInstance manifests (YAML, multiple documents allowed)
    #[arg(required = true)]
    pub manifests: Vec<PathBuf>,

    /// Outcome of every pre-deployment check task
    #[arg(long, value_enum, default_value = "succeeded")]
    pub pre_outcome: Outcome,

    /// Outcome of every post-deployment check task
    #[arg(long, value_enum, default_value = "succeeded")]
    pub post_outcome: Outcome,

    /// Time a check task takes to finish
    #[arg(long, default_value = "50")]
    pub task_delay_ms: u64,

    /// Poll interval while a check task runs (overrides config)
    #[arg(long)]
    pub requeue_after_ms: Option<u64>,

    /// Give up if instances are not completed within this time
    #[arg(long, default_value = "30")]
    pub timeout_secs: u64,

    #[arg(long, value_enum, default_value = "yaml")]
    pub output: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    // a missing .env is fine
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Config { command } => cmd::cmd_config(&cli, command.clone())?,
        Commands::Simulate(args) => cmd::cmd_simulate(&cli, args).await?,
    }

    Ok(())
}
