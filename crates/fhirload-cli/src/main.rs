mod cli;
mod commands;
mod config;
mod observability;
mod output;

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::debug;

use cli::{Cli, Commands};
use output::print_error;

/// Where the configuration file path came from.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From FHIRLOAD_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (fhirload.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (FHIRLOAD_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    observability::init_tracing_with_level(observability::effective_level("info", cli.verbose));

    let (config_path, source) = resolve_config_path(&cli);
    let mut cfg = config::loader::load_config(config_path.as_deref())
        .map_err(|e| anyhow!("Failed to load configuration from {source}: {e}"))?;

    cli.postgres.apply(&mut cfg);
    match &cli.command {
        Commands::Load(args) => args.apply(&mut cfg),
        Commands::Bulkget(args) => args.download.apply(&mut cfg),
    }
    cfg.validate()
        .map_err(|e| anyhow!("Invalid configuration: {e}"))?;

    observability::apply_logging_level(observability::effective_level(
        &cfg.logging.level,
        cli.verbose,
    ));
    debug!(%source, path = ?config_path, "Configuration loaded");

    match &cli.command {
        Commands::Load(args) => commands::load::run(&cfg, args).await,
        Commands::Bulkget(args) => commands::bulkget::run(&cfg, args).await,
    }
}

fn resolve_config_path(cli: &Cli) -> (Option<PathBuf>, ConfigSource) {
    match &cli.config {
        // clap fills `--config` from the environment as well
        Some(path) => {
            let from_env = std::env::var_os("FHIRLOAD_CONFIG")
                .is_some_and(|value| PathBuf::from(value) == *path);
            let source = if from_env {
                ConfigSource::EnvironmentVariable
            } else {
                ConfigSource::CliArgument
            };
            (Some(path.clone()), source)
        }
        None => (None, ConfigSource::Default),
    }
}
