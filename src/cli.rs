//! Command-line interface for Apollo.
use clap::Parser;

use crate::constants::DEFAULT_CONFIG_PATH;

/// Per-host self-healing daemon cooperating with a local Consul agent.
#[derive(Parser)]
#[command(name = "apollo", version, author)]
#[command(
    about = "Keeps this host healthy in its Consul service pool",
    long_about = None
)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Path to the PID file (overrides the config value).
    #[arg(long = "pid-file")]
    pub pid_file: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
