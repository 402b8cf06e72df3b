//! Logging setup.
//!
//! All components log through `tracing`; this module only installs the
//! global subscriber. The output target follows the CLI `--log` switch:
//! `0`/`off`, `1`/`stdout`, `2`/`stderr` (default), or a file path that is
//! opened in append mode. `DEDUPE_LOG` overrides the level filter using the
//! usual `EnvFilter` directive syntax.

use anyhow::Result;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_FILTER_ENV: &str = "DEDUPE_LOG";

/// Where log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Off,
    Stdout,
    Stderr,
    File(PathBuf),
}

impl FromStr for LogTarget {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "0" | "off" => LogTarget::Off,
            "1" | "stdout" => LogTarget::Stdout,
            "2" | "stderr" | "" => LogTarget::Stderr,
            path => LogTarget::File(PathBuf::from(path)),
        })
    }
}

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// Install the global tracing subscriber for the given target.
pub fn init_logging(target: &LogTarget, verbose: bool) -> Result<()> {
    match target {
        LogTarget::Off => {}
        LogTarget::Stdout => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter(verbose))
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogTarget::Stderr => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter(verbose))
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogTarget::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter(verbose))
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}
