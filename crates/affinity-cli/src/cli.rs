use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "affinity",
    about = "Drive thread-affine object graphs across owner and worker threads",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an object on a home thread and mutate it from a worker
    Scenario(ScenarioArgs),
    /// Hammer one counter from many writer threads
    Stress(StressArgs),
    /// Hand a context across a chain of threads
    Migrate(MigrateArgs),
    /// Print the effective configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct ScenarioArgs {
    /// Marshal deadline in milliseconds (unbounded if omitted)
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Args)]
pub struct StressArgs {
    #[arg(long, default_value_t = 4)]
    pub writers: usize,
    #[arg(long, default_value_t = 250)]
    pub ops: usize,
}

#[derive(Args)]
pub struct MigrateArgs {
    #[arg(long, default_value_t = 3)]
    pub hops: usize,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// TOML file to load
    #[arg(long)]
    pub file: Option<PathBuf>,
}
