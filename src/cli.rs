//! CLI argument parsing with subcommand architecture.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "payrail", version, about = "Payment orchestration API server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the API server (default when no subcommand is given)
    Run(RunArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to config file
    #[arg(short, long, default_value = "config.yaml", env = "PAYRAIL_CONFIG")]
    pub config: String,

    /// Listen host
    #[arg(long, env = "PAYRAIL_HOST")]
    pub host: Option<String>,

    /// Listen port
    #[arg(long, env = "PAYRAIL_PORT")]
    pub port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info", env = "PAYRAIL_LOG_LEVEL")]
    pub log_level: String,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            config: "config.yaml".to_string(),
            host: None,
            port: None,
            log_level: "info".to_string(),
        }
    }
}
