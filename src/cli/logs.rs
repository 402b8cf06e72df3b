//! Logs subcommand: page through the merge audit log.

use anyhow::Result;
use chrono::Utc;
use clap::Args;

use super::{OutputFormat, print_json};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::executor::AuditLog;
use crate::types::{DEFAULT_PAGE_SIZE, DateRange, MergeLogPage, MergeLogQuery, Statistics};

/// Arguments for the logs subcommand
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Only entries for this object type
    #[arg(long, value_name = "TYPE")]
    pub object_type: Option<String>,

    /// Only entries produced under this configuration
    #[arg(long, value_name = "ID")]
    pub config_id: Option<String>,

    /// Date window: today, yesterday, this-week, this-month, last-month, this-year, all
    #[arg(long, default_value = "all", value_name = "RANGE")]
    pub range: DateRange,

    /// Entries per page
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: u32,

    /// Page number, starting at 1
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Print aggregate statistics instead of entries
    #[arg(long)]
    pub stats: bool,

    /// Output format: text (default) or json
    #[arg(short, long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,
}

impl LogsArgs {
    pub fn query(&self) -> MergeLogQuery {
        MergeLogQuery {
            object_type: self.object_type.clone(),
            config_id: self.config_id.clone(),
            page_size: self.page_size.max(1),
            page_number: self.page.max(1),
            date_range: self.range,
        }
    }
}

pub fn run_logs(config: &EngineConfig, args: LogsArgs) -> Result<()> {
    let db = Database::open(&config.paths.db_path)?;
    let now = Utc::now();

    if args.stats {
        let stats = db.statistics(args.range, now)?;
        match args.format {
            OutputFormat::Json => print_json(&stats)?,
            OutputFormat::Text => print!("{}", render_stats(&stats)),
        }
        return Ok(());
    }

    let page = AuditLog::list_merge_logs(&db, &args.query(), now)?;
    match args.format {
        OutputFormat::Json => print_json(&page)?,
        OutputFormat::Text => print!("{}", render_page(&page)),
    }
    Ok(())
}

fn render_page(page: &MergeLogPage) -> String {
    let mut out = String::new();
    for log in &page.records {
        out.push_str(&format!(
            "{}  {:<12} {} <- {}  by {}\n",
            log.execution_time.format("%Y-%m-%d %H:%M:%S"),
            log.object_type,
            log.master_id,
            log.merged_ids.join(", "),
            log.initiator
        ));
        if let Some(ref note) = log.note {
            out.push_str(&format!("    {}\n", note));
        }
    }
    let p = &page.pagination;
    out.push_str(&format!(
        "Page {} of {} ({} entries)\n",
        p.page_number,
        p.total_pages.max(1),
        p.total_records
    ));
    out
}

fn render_stats(stats: &Statistics) -> String {
    let mut out = format!(
        "Duplicates found: {}\nRecords merged:   {}\n",
        stats.duplicates_found, stats.records_merged
    );
    for (object, counts) in &stats.by_object {
        out.push_str(&format!(
            "  {:<16} found {:<6} merged {}\n",
            object, counts.duplicates_found, counts.records_merged
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MergeLog, Pagination};
    use chrono::TimeZone;

    #[test]
    fn test_render_page() {
        let page = MergeLogPage {
            records: vec![MergeLog {
                id: "l1".into(),
                job_id: None,
                config_id: None,
                object_type: "Account".into(),
                master_id: "a".into(),
                merged_ids: vec!["b".into(), "c".into()],
                field_resolutions: vec![],
                note: Some("1 conflict. Phone".into()),
                initiator: "cli".into(),
                execution_time: Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap(),
            }],
            pagination: Pagination::new(25, 1, 1),
        };
        let text = render_page(&page);
        assert!(text.contains("2024-06-01 08:30:00"));
        assert!(text.contains("a <- b, c"));
        assert!(text.contains("Page 1 of 1 (1 entries)"));
    }

    #[test]
    fn test_query_clamps_paging() {
        let args = LogsArgs {
            object_type: Some("Account".into()),
            config_id: None,
            range: DateRange::Today,
            page_size: 0,
            page: 0,
            stats: false,
            format: OutputFormat::Text,
        };
        let query = args.query();
        assert_eq!(query.page_size, 1);
        assert_eq!(query.page_number, 1);
        assert_eq!(query.date_range, DateRange::Today);
    }
}
