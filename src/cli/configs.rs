//! Configs subcommand: list the active matching configurations.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use super::{OutputFormat, print_json};
use crate::config::EngineConfig;
use crate::resolver::{ConfigurationResolver, YamlConfigurationSource};
use crate::types::MatchConfiguration;

/// Arguments for the configs subcommand
#[derive(Args, Debug)]
pub struct ConfigsArgs {
    /// Configurations file (overrides config)
    #[arg(long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,
}

pub fn run_configs(config: &EngineConfig, args: ConfigsArgs) -> Result<()> {
    let path = args
        .file
        .unwrap_or_else(|| config.paths.configurations_path.clone());
    let resolver = ConfigurationResolver::new(YamlConfigurationSource::new(path))
        .with_default_batch_size(config.jobs.default_batch_size);
    let configs = resolver.list_active_configurations()?;

    match args.format {
        OutputFormat::Json => print_json(&configs)?,
        OutputFormat::Text => print!("{}", render_table(&configs)),
    }
    Ok(())
}

fn render_table(configs: &[MatchConfiguration]) -> String {
    if configs.is_empty() {
        return "No active matching configurations\n".to_string();
    }
    let mut out = String::new();
    for config in configs {
        out.push_str(&format!(
            "{:<24} {:<12} {:<14} batch {:<5} [{}]\n",
            config.label,
            config.object_type,
            config.master_strategy,
            config.batch_size,
            config.match_fields.join(", ")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MasterStrategy;

    #[test]
    fn test_render_table() {
        assert_eq!(render_table(&[]), "No active matching configurations\n");

        let config = MatchConfiguration {
            id: "acct".into(),
            label: "Accounts".into(),
            developer_name: "Accounts".into(),
            object_type: "Account".into(),
            match_fields: vec!["Name".into(), "Phone".into()],
            required_fields: vec![],
            field_labels: Default::default(),
            master_strategy: MasterStrategy::MostComplete,
            batch_size: 200,
            active: true,
        };
        let table = render_table(&[config]);
        assert!(table.contains("MostComplete"));
        assert!(table.contains("[Name, Phone]"));
    }
}
