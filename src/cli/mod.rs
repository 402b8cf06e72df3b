//! CLI command definitions for dedupe-engine
//!
//! This module defines the CLI structure using clap's derive macros.
//! Each subcommand keeps its arguments and its `run` function in its own file.

pub mod configs;
pub mod demo;
pub mod logs;
pub mod preview;

use clap::{Parser, Subcommand};
use configs::ConfigsArgs;
use demo::DemoArgs;
use logs::LogsArgs;
use preview::PreviewArgs;
use serde::Serialize;

/// Duplicate-group resolution and merge orchestration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the active matching configurations
    Configs(ConfigsArgs),

    /// Compute a merge preview for a group from a JSON file
    Preview(PreviewArgs),

    /// Query the merge audit log
    Logs(LogsArgs),

    /// Run a dry run and bulk merge against an in-memory record store
    Demo(DemoArgs),
}

/// Output format for command results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid format '{}'. Valid options: text, json",
                s
            )),
        }
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_logs_command() {
        let cli = Cli::try_parse_from([
            "dedupe-engine",
            "--database",
            "/tmp/x.db",
            "logs",
            "--range",
            "this-week",
            "--page",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.database.as_deref(), Some("/tmp/x.db"));
        match cli.command {
            Command::Logs(args) => {
                assert_eq!(args.page, 2);
                assert_eq!(args.range, crate::types::DateRange::ThisWeek);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
