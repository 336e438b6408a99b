use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use pgmeili_config::PgMeiliConfig;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod env;
mod initial_load;

use cli::{Cli, Commands, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Before tracing, so RUST_LOG can come from the env file.
    let env_file = env::load_dotenv_from_ancestors(cli.env.as_deref())?;
    init_tracing(cli.log_format)?;
    if let Some(path) = env_file {
        tracing::info!(path = %path.display(), "Loaded environment file");
    }

    match cli.command {
        Commands::Init { path } => commands::cmd_init(&path),
        Commands::Check => {
            let config = load_config(&cli.config)?;
            commands::cmd_check(&config)
        }
        Commands::Run { force_initial_load } => {
            let config = load_config(&cli.config)?;
            commands::cmd_run(config, force_initial_load).await
        }
    }
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("pgmeili=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<PgMeiliConfig> {
    PgMeiliConfig::load(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}
