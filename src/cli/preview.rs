//! Preview subcommand: compute field resolutions for one duplicate group.
//!
//! The input is a JSON document holding the configuration record, the group
//! and the member snapshots. No record store is contacted.

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{OutputFormat, print_json};
use crate::config::EngineConfig;
use crate::master::{ensure_master, set_master};
use crate::preview::{MergePreview, preview_for_configuration};
use crate::resolver::ConfigurationRecord;
use crate::types::{DuplicateGroup, RecordId, RecordSnapshot, ResolutionStatus, display_value};

/// Arguments for the preview subcommand
#[derive(Args, Debug)]
pub struct PreviewArgs {
    /// JSON file with `configuration`, `group` and `records`
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    /// Use this record as master instead of the configured strategy
    #[arg(long, value_name = "ID")]
    pub master: Option<String>,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,
}

#[derive(Debug, Deserialize)]
pub struct PreviewInput {
    pub configuration: ConfigurationRecord,
    pub group: DuplicateGroup,
    pub records: Vec<RecordSnapshot>,
}

/// Build the preview described by `input`.
pub fn build_preview(
    input: PreviewInput,
    master: Option<&str>,
    default_batch_size: u32,
) -> Result<MergePreview> {
    let config = input.configuration.into_configuration(default_batch_size)?;
    let mut group = input.group;
    let snapshots: BTreeMap<RecordId, RecordSnapshot> = input
        .records
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect();

    let master_id = match master {
        Some(id) => {
            set_master(&mut group, id)?;
            id.to_string()
        }
        None => ensure_master(&mut group, config.master_strategy, &snapshots)?,
    };
    Ok(preview_for_configuration(&config, &group, &master_id, &snapshots)?)
}

pub fn run_preview(config: &EngineConfig, args: PreviewArgs) -> Result<()> {
    let content = std::fs::read_to_string(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let input: PreviewInput = serde_json::from_str(&content)
        .with_context(|| format!("Invalid preview input {}", args.input.display()))?;
    let preview = build_preview(input, args.master.as_deref(), config.jobs.default_batch_size)?;

    match args.format {
        OutputFormat::Json => print_json(&preview)?,
        OutputFormat::Text => print!("{}", render(&preview)),
    }
    Ok(())
}

fn render(preview: &MergePreview) -> String {
    let mut out = format!(
        "Group {} (master {})\n",
        preview.group_id, preview.master_id
    );
    for r in &preview.resolutions {
        let value = r
            .chosen_value
            .as_ref()
            .map(display_value)
            .unwrap_or_else(|| "-".to_string());
        let marker = match r.status {
            ResolutionStatus::Unchanged => " ",
            ResolutionStatus::Filled => "+",
            ResolutionStatus::Conflict => "!",
        };
        out.push_str(&format!("{} {:<20} {}", marker, r.label, value));
        if !r.candidate_values.is_empty() {
            let others: Vec<String> = r.candidate_values.iter().map(display_value).collect();
            out.push_str(&format!("  (also: {})", others.join(", ")));
        }
        out.push('\n');
    }
    out.push_str(&preview.conflict_summary);
    out.push('\n');
    out
}
