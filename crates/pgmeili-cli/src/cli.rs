use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "pgmeili")]
#[command(about = "Mirror Postgres tables into Meilisearch indexes")]
#[command(version)]
pub struct Cli {
    /// Path to the pgmeili.toml config file
    #[arg(short, long, global = true, default_value = "pgmeili.toml")]
    pub config: PathBuf,

    /// Environment to load (loads .env.{ENV} instead of .env)
    #[arg(short, long, global = true)]
    pub env: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start replicating changes into the search indexes
    Run {
        /// Also load tables that have initial_load turned off
        #[arg(long)]
        force_initial_load: bool,
    },

    /// Validate the config file and list the synced tables
    Check,

    /// Write a sample pgmeili.toml and .env.example
    Init {
        /// Directory to initialize
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}
