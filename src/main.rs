//! dedupe-engine
//!
//! Command-line entry point: loads the tiered configuration, installs
//! logging and dispatches to a subcommand.

use anyhow::Result;
use clap::Parser;
use dedupe_engine::cli::{Cli, Command, configs, demo, logs, preview};
use dedupe_engine::config::{ConfigLoader, ConfigPaths, EngineConfig};
use dedupe_engine::logging::{LogTarget, init_logging};
use tracing::debug;

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::load_file(ConfigPaths::discover(), path.into())?,
        None => ConfigLoader::load()?,
    };
    for source in loader.sources() {
        debug!("Configuration source: {}", source.display());
    }

    let mut config = loader.into_config();
    if let Some(db_path) = &cli.database {
        config.paths.db_path = db_path.into();
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let target: LogTarget = cli.log.parse()?;
    init_logging(&target, cli.verbose)?;

    let config = load_config(&cli)?;

    match cli.command {
        Command::Configs(args) => configs::run_configs(&config, args)?,
        Command::Preview(args) => preview::run_preview(&config, args)?,
        Command::Logs(args) => logs::run_logs(&config, args)?,
        Command::Demo(args) => demo::run_demo(&config, args).await?,
    }

    Ok(())
}
