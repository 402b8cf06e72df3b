//! Demo subcommand: a full dry run and bulk merge against sample accounts.
//!
//! Records live in an [`InMemoryBackend`]; the audit log goes to an in-memory
//! database unless `--persist` is given.

use anyhow::{Result, anyhow};
use chrono::{TimeZone, Utc};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backend::memory::InMemoryBackend;
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, JobsConfig};
use crate::db::Database;
use crate::drafts::{BestEffortDrafts, SqliteDrafts};
use crate::executor::MergeExecutor;
use crate::orchestrator::{JobOrchestrator, spawn_poll_loop};
use crate::resolver::{ConfigurationRecord, ConfigurationResolver, StaticConfigurationSource};
use crate::store::sync::spawn_flush_loop;
use crate::store::{Interest, Store, SyncBus};
use crate::types::{MergeLogQuery, RecordSnapshot};

const MAX_POLLS: usize = 20;
/// The in-memory backend answers immediately, so the demo polls quickly.
const DEMO_POLL_MS: u64 = 50;

/// Arguments for the demo subcommand
#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Write the audit log to the configured database
    #[arg(long)]
    pub persist: bool,

    /// Stop after the dry run
    #[arg(long)]
    pub dry_run_only: bool,
}

fn sample_configuration() -> ConfigurationRecord {
    ConfigurationRecord {
        id: Some("account-name".into()),
        label: "Accounts by name".into(),
        developer_name: "Account_Name".into(),
        object_type: "Account".into(),
        match_fields: "Name".into(),
        required_fields: Some("Phone".into()),
        field_labels: [
            ("Name".to_string(), "Account Name".to_string()),
            ("Phone".to_string(), "Phone".to_string()),
        ]
        .into_iter()
        .collect(),
        master_strategy: Some("OldestCreated".into()),
        batch_size: Some(200),
        active: true,
    }
}

fn sample_accounts() -> Vec<RecordSnapshot> {
    let day = |m, d| Utc.with_ymd_and_hms(2023, m, d, 9, 0, 0).single().unwrap_or_default();
    vec![
        RecordSnapshot::new("001A", day(1, 5))
            .with_field("Name", "Acme Corp")
            .with_field("Phone", "555-0100"),
        RecordSnapshot::new("001B", day(3, 10))
            .with_field("Name", "ACME CORP")
            .with_field("Phone", "555-0199"),
        RecordSnapshot::new("001C", day(6, 1))
            .with_field("Name", "acme corp ")
            .with_field("Industry", "Manufacturing"),
        RecordSnapshot::new("001D", day(2, 14)).with_field("Name", "Globex"),
        RecordSnapshot::new("001E", day(4, 2))
            .with_field("Name", "Initech")
            .with_field("Phone", "555-0142"),
        RecordSnapshot::new("001F", day(4, 3)).with_field("Name", "initech"),
    ]
}

pub async fn run_demo(config: &EngineConfig, args: DemoArgs) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = SyncBus::new(config.store.bus_capacity);
    let store = Arc::new(Store::new(&config.store, clock.clone()).with_bus(bus));
    let _subscription = store.subscribe(Interest::All, |n| {
        debug!(sections = ?n.sections, "Store changed");
    });

    let db = if args.persist {
        Database::open(&config.paths.db_path)?
    } else {
        Database::open_in_memory()?
    };

    let resolver = Arc::new(
        ConfigurationResolver::new(StaticConfigurationSource::new(vec![sample_configuration()]))
            .with_default_batch_size(config.jobs.default_batch_size),
    );
    let backend = Arc::new(InMemoryBackend::new(clock.clone()));
    for configuration in resolver.list_active_configurations()? {
        backend.add_configuration(configuration);
    }
    for account in sample_accounts() {
        backend.insert_record("Account", account);
    }

    let jobs = JobsConfig {
        poll_interval_ms: DEMO_POLL_MS,
        ..config.jobs.clone()
    };
    let orchestrator = Arc::new(
        JobOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&resolver),
            backend.clone(),
            Arc::new(db.clone()),
            BestEffortDrafts::new(Arc::new(SqliteDrafts::new(db.clone()))),
        )
        .with_config(jobs),
    );
    let flusher = spawn_flush_loop(
        Arc::clone(&store),
        Duration::from_millis(config.store.throttle_window_ms.max(1)),
    );

    let configs = orchestrator.load_configurations(false).await?;
    let selected = configs
        .first()
        .ok_or_else(|| anyhow!("No active matching configurations"))?;
    let draft = orchestrator.select_configuration(&selected.id)?;
    println!(
        "Selected '{}' on {} (batch size {})",
        selected.label, draft.object_type, draft.batch_size
    );

    let job = orchestrator.submit(true).await?;
    println!("Submitted dry run {}", job.id);
    let poller = spawn_poll_loop(Arc::clone(&orchestrator));
    for _ in 0..MAX_POLLS {
        if orchestrator.pending_job_ids().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(DEMO_POLL_MS)).await;
    }
    poller.abort();

    let state = store.get_state();
    if let Some(done) = state.job(&job.id) {
        println!(
            "Dry run {}: scanned {} records, {} duplicates found",
            done.status, done.records_processed, done.duplicates_found
        );
    }
    for group in state.groups.values() {
        let members: Vec<&str> = group.member_record_ids.iter().map(String::as_str).collect();
        println!("  group {}: {}", group.id, members.join(", "));
    }
    if args.dry_run_only {
        flusher.abort();
        store.flush();
        return Ok(());
    }

    let merger = MergeExecutor::new(backend.clone(), Arc::new(db.clone()), Arc::clone(&store));
    for (group_id, outcome) in orchestrator.merge_selected(&merger, "demo").await? {
        match outcome {
            Ok(result) if result.success => println!(
                "Merged {} into {}",
                group_id,
                result.merged_id.unwrap_or_default()
            ),
            Ok(result) => println!("Merge of {} failed: {}", group_id, result.errors.join("; ")),
            Err(e) => println!("Merge of {} rejected: {}", group_id, e.message),
        }
    }

    let page = orchestrator.load_merge_logs(&MergeLogQuery::default())?;
    println!("{} audit entries", page.pagination.total_records);
    println!(
        "{} Account records remain",
        backend.record_count("Account")
    );
    flusher.abort();
    store.flush();
    Ok(())
}
