//! In-process record store and batch executor.
//!
//! Jobs advance one step per status poll: `Queued` → `Running` → terminal.
//! Detection groups records whose normalized match-field values are equal.
//! Failures can be scripted per operation with [`InMemoryBackend::fail_next`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use super::{
    BatchExecutor, CompletedMerge, JobProgress, MergeCall, MergeOutcome, RecordStore,
    RemoteError, RemoteResult, ScheduleSpec,
};
use crate::clock::Clock;
use crate::master::select_master;
use crate::types::{
    DateRange, DuplicateGroup, JobId, JobStatus, MatchConfiguration, MergeJob, RecordId,
    RecordSnapshot, ScheduledJob, Statistics, display_value, is_blank,
};

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    SubmitJob,
    JobStatus,
    ListJobs,
    ListGroups,
    Schedule,
    DeleteSchedule,
    ListSchedules,
    Statistics,
    Merge,
    LoadRecords,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::SubmitJob => "submit_job",
            Operation::JobStatus => "job_status",
            Operation::ListJobs => "list_jobs",
            Operation::ListGroups => "list_groups",
            Operation::Schedule => "schedule_job",
            Operation::DeleteSchedule => "delete_schedule",
            Operation::ListSchedules => "list_schedules",
            Operation::Statistics => "get_statistics",
            Operation::Merge => "merge_records",
            Operation::LoadRecords => "load_records",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredJob {
    job: MergeJob,
    groups: Vec<DuplicateGroup>,
    merges: Vec<CompletedMerge>,
}

#[derive(Debug, Clone)]
struct MergeEvent {
    at: DateTime<Utc>,
    object_type: String,
    merged: u64,
}

#[derive(Debug, Clone)]
struct DetectionEvent {
    at: DateTime<Utc>,
    object_type: String,
    duplicates: u64,
}

#[derive(Default)]
struct MemoryState {
    configurations: BTreeMap<String, MatchConfiguration>,
    records: BTreeMap<String, BTreeMap<RecordId, RecordSnapshot>>,
    jobs: BTreeMap<JobId, StoredJob>,
    schedules: BTreeMap<String, ScheduledJob>,
    applied_keys: BTreeSet<String>,
    failures: BTreeMap<Operation, VecDeque<RemoteError>>,
    calls: Vec<String>,
    merges: Vec<MergeEvent>,
    detections: Vec<DetectionEvent>,
    next_id: u64,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:04}", prefix, self.next_id)
    }

    /// Log the call and pop a scripted failure, if any.
    fn enter(&mut self, op: Operation, detail: &str) -> RemoteResult<()> {
        if detail.is_empty() {
            self.calls.push(op.as_str().to_string());
        } else {
            self.calls.push(format!("{}:{}", op.as_str(), detail));
        }
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    latency: Option<Duration>,
}

impl InMemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            latency: None,
        }
    }

    /// Sleep this long inside every merge call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // State is plain data; a panicked holder leaves it usable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_configuration(&self, config: MatchConfiguration) {
        self.lock()
            .configurations
            .insert(config.id.clone(), config);
    }

    pub fn insert_record(&self, object_type: &str, snapshot: RecordSnapshot) {
        self.lock()
            .records
            .entry(object_type.to_string())
            .or_default()
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn record(&self, object_type: &str, id: &str) -> Option<RecordSnapshot> {
        self.lock()
            .records
            .get(object_type)
            .and_then(|r| r.get(id))
            .cloned()
    }

    pub fn record_count(&self, object_type: &str) -> usize {
        self.lock().records.get(object_type).map_or(0, BTreeMap::len)
    }

    /// Make the next call of `op` fail with `err`. Failures queue up.
    pub fn fail_next(&self, op: Operation, err: RemoteError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Calls received so far, e.g. `merge_records:a`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: Operation) -> usize {
        let prefix = op.as_str();
        self.lock()
            .calls
            .iter()
            .filter(|c| c.as_str() == prefix || c.starts_with(&format!("{}:", prefix)))
            .count()
    }

    /// Queue a run of a registered schedule, as its trigger would.
    pub fn fire_schedule(&self, schedule_id: &str) -> RemoteResult<JobId> {
        let mut state = self.lock();
        let schedule = state
            .schedules
            .get(schedule_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("schedule {}", schedule_id)))?;
        let job = self.queue_job(
            &mut state,
            &schedule.config_id,
            schedule.is_dry_run,
            schedule.batch_size,
        )?;
        info!(schedule_id = %schedule_id, job_id = %job, "Schedule fired");
        Ok(job)
    }

    fn queue_job(
        &self,
        state: &mut MemoryState,
        config_id: &str,
        is_dry_run: bool,
        batch_size: u32,
    ) -> RemoteResult<JobId> {
        let config = state
            .configurations
            .get(config_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("configuration {}", config_id)))?;
        let id = state.next_id("job-");
        let job = MergeJob {
            id: id.clone(),
            config_id: config_id.to_string(),
            object_type: Some(config.object_type.clone()),
            is_dry_run,
            batch_size,
            status: JobStatus::Queued,
            records_processed: 0,
            duplicates_found: 0,
            error_messages: Vec::new(),
            submitted_at: Some(self.clock.now()),
            completion_time: None,
        };
        state.jobs.insert(
            id.clone(),
            StoredJob {
                job,
                groups: Vec::new(),
                merges: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Run detection (and merging, for merge jobs) and finish the job.
    fn run_job(&self, state: &mut MemoryState, job_id: &str) {
        let now = self.clock.now();
        let Some(stored) = state.jobs.get(job_id).cloned() else {
            return;
        };
        let Some(config) = state.configurations.get(&stored.job.config_id).cloned() else {
            if let Some(stored) = state.jobs.get_mut(job_id) {
                stored.job.status = JobStatus::Failed;
                stored.job.error_messages =
                    vec![format!("configuration {} was removed", stored.job.config_id)];
                stored.job.completion_time = Some(now);
            }
            return;
        };

        let records = state
            .records
            .get(&config.object_type)
            .cloned()
            .unwrap_or_default();
        let groups = detect_groups(job_id, &config, &records);
        let duplicates: u64 = groups
            .iter()
            .map(|g| g.member_record_ids.len() as u64 - 1)
            .sum();

        let mut merges = Vec::new();
        if !stored.job.is_dry_run {
            for group in &groups {
                let Ok(master) = select_master(group, config.master_strategy, &records) else {
                    continue;
                };
                let mut merged_ids = Vec::new();
                if let Some(by_id) = state.records.get_mut(&config.object_type) {
                    for id in group.member_record_ids.iter().filter(|id| **id != master) {
                        if by_id.remove(id).is_some() {
                            merged_ids.push(id.clone());
                        }
                    }
                }
                if !merged_ids.is_empty() {
                    state.merges.push(MergeEvent {
                        at: now,
                        object_type: config.object_type.clone(),
                        merged: merged_ids.len() as u64,
                    });
                    merges.push(CompletedMerge {
                        object_type: config.object_type.clone(),
                        master_id: master,
                        merged_ids,
                    });
                }
            }
        }

        state.detections.push(DetectionEvent {
            at: now,
            object_type: config.object_type.clone(),
            duplicates,
        });

        if let Some(stored) = state.jobs.get_mut(job_id) {
            stored.job.status = JobStatus::Completed;
            stored.job.records_processed = records.len() as u64;
            stored.job.duplicates_found = duplicates;
            stored.job.completion_time = Some(now);
            stored.groups = if stored.job.is_dry_run { groups } else { Vec::new() };
            stored.merges = merges;
        }
        debug!(job_id = %job_id, duplicates, "In-memory job finished");
    }
}

/// Normalized grouping key; `None` when every match field is blank.
fn match_key(snapshot: &RecordSnapshot, fields: &[String]) -> Option<Vec<String>> {
    let key: Vec<String> = fields
        .iter()
        .map(|f| {
            snapshot
                .fields
                .get(f)
                .filter(|v| !is_blank(v))
                .map(|v| display_value(v).trim().to_lowercase())
                .unwrap_or_default()
        })
        .collect();
    if key.iter().all(String::is_empty) {
        None
    } else {
        Some(key)
    }
}

fn detect_groups(
    job_id: &str,
    config: &MatchConfiguration,
    records: &BTreeMap<RecordId, RecordSnapshot>,
) -> Vec<DuplicateGroup> {
    let mut buckets: BTreeMap<Vec<String>, Vec<RecordId>> = BTreeMap::new();
    for snapshot in records.values() {
        if let Some(key) = match_key(snapshot, &config.match_fields) {
            buckets.entry(key).or_default().push(snapshot.id.clone());
        }
    }
    buckets
        .into_values()
        .filter(|ids| ids.len() > 1)
        .enumerate()
        .map(|(i, ids)| {
            DuplicateGroup::new(
                format!("{}-g{}", job_id, i + 1),
                config.object_type.clone(),
                ids,
                100,
            )
        })
        .collect()
}

#[async_trait]
impl RecordStore for InMemoryBackend {
    async fn merge_records(&self, call: &MergeCall) -> RemoteResult<MergeOutcome> {
        self.lock().enter(Operation::Merge, &call.master_id)?;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let now = self.clock.now();
        let mut state = self.lock();
        if state.applied_keys.contains(&call.idempotency_key) {
            return Err(RemoteError::Rejected(format!(
                "merge {} was already applied",
                call.idempotency_key
            )));
        }

        let Some(by_id) = state.records.get_mut(&call.object_type) else {
            return Err(RemoteError::NotFound(format!("object type {}", call.object_type)));
        };
        let missing: Vec<&RecordId> = std::iter::once(&call.master_id)
            .chain(call.duplicate_ids.iter())
            .filter(|id| !by_id.contains_key(*id))
            .collect();
        if !missing.is_empty() {
            let ids: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
            return Ok(MergeOutcome {
                success: false,
                merged_id: None,
                errors: vec![format!("Records not found: {}", ids.join(", "))],
            });
        }

        if let Some(master) = by_id.get_mut(&call.master_id) {
            for (field, value) in &call.field_values {
                master.fields.insert(field.clone(), value.clone());
            }
            master.modified_at = now;
        }
        for id in &call.duplicate_ids {
            by_id.remove(id);
        }

        state.applied_keys.insert(call.idempotency_key.clone());
        state.merges.push(MergeEvent {
            at: now,
            object_type: call.object_type.clone(),
            merged: call.duplicate_ids.len() as u64,
        });
        Ok(MergeOutcome {
            success: true,
            merged_id: Some(call.master_id.clone()),
            errors: Vec::new(),
        })
    }

    async fn load_records(
        &self,
        object_type: &str,
        ids: &[RecordId],
    ) -> RemoteResult<Vec<RecordSnapshot>> {
        let mut state = self.lock();
        state.enter(Operation::LoadRecords, object_type)?;
        let Some(by_id) = state.records.get(object_type) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| by_id.get(id).cloned()).collect())
    }
}

#[async_trait]
impl BatchExecutor for InMemoryBackend {
    async fn submit_job(
        &self,
        config_id: &str,
        is_dry_run: bool,
        batch_size: u32,
    ) -> RemoteResult<JobId> {
        let mut state = self.lock();
        state.enter(Operation::SubmitJob, config_id)?;
        self.queue_job(&mut state, config_id, is_dry_run, batch_size)
    }

    async fn job_status(&self, job_id: &str) -> RemoteResult<JobProgress> {
        let mut state = self.lock();
        state.enter(Operation::JobStatus, job_id)?;
        let status = state
            .jobs
            .get(job_id)
            .map(|s| s.job.status)
            .ok_or_else(|| RemoteError::NotFound(format!("job {}", job_id)))?;

        match status {
            JobStatus::Queued => {
                if let Some(stored) = state.jobs.get_mut(job_id) {
                    stored.job.status = JobStatus::Running;
                }
            }
            JobStatus::Running => self.run_job(&mut state, job_id),
            _ => {}
        }

        let stored = state
            .jobs
            .get(job_id)
            .ok_or_else(|| RemoteError::NotFound(format!("job {}", job_id)))?;
        Ok(JobProgress {
            job_id: job_id.to_string(),
            status: stored.job.status,
            records_processed: stored.job.records_processed,
            duplicates_found: stored.job.duplicates_found,
            error_messages: stored.job.error_messages.clone(),
            merges: stored.merges.clone(),
        })
    }

    async fn list_jobs(&self) -> RemoteResult<Vec<MergeJob>> {
        let mut state = self.lock();
        state.enter(Operation::ListJobs, "")?;
        Ok(state.jobs.values().map(|s| s.job.clone()).collect())
    }

    async fn list_groups(&self, job_id: &str) -> RemoteResult<Vec<DuplicateGroup>> {
        let mut state = self.lock();
        state.enter(Operation::ListGroups, job_id)?;
        state
            .jobs
            .get(job_id)
            .map(|s| s.groups.clone())
            .ok_or_else(|| RemoteError::NotFound(format!("job {}", job_id)))
    }

    async fn schedule_job(&self, spec: &ScheduleSpec) -> RemoteResult<String> {
        let mut state = self.lock();
        state.enter(Operation::Schedule, &spec.job_name)?;
        if !state.configurations.contains_key(&spec.config_id) {
            return Err(RemoteError::NotFound(format!(
                "configuration {}",
                spec.config_id
            )));
        }
        if state.schedules.values().any(|s| s.job_name == spec.job_name) {
            return Err(RemoteError::Rejected(format!(
                "a job named {} is already scheduled",
                spec.job_name
            )));
        }
        let id = state.next_id("sched-");
        state.schedules.insert(
            id.clone(),
            ScheduledJob {
                id: id.clone(),
                config_id: spec.config_id.clone(),
                cron_expression: spec.cron_expression.clone(),
                job_name: spec.job_name.clone(),
                is_dry_run: spec.is_dry_run,
                batch_size: spec.batch_size,
            },
        );
        Ok(id)
    }

    async fn delete_schedule(&self, schedule_id: &str) -> RemoteResult<()> {
        let mut state = self.lock();
        state.enter(Operation::DeleteSchedule, schedule_id)?;
        state
            .schedules
            .remove(schedule_id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(format!("schedule {}", schedule_id)))
    }

    async fn list_schedules(&self) -> RemoteResult<Vec<ScheduledJob>> {
        let mut state = self.lock();
        state.enter(Operation::ListSchedules, "")?;
        Ok(state.schedules.values().cloned().collect())
    }

    async fn get_statistics(&self, range: DateRange) -> RemoteResult<Statistics> {
        let mut state = self.lock();
        state.enter(Operation::Statistics, "")?;
        let bounds = range.bounds(self.clock.now());
        let in_range =
            |at: &DateTime<Utc>| bounds.is_none_or(|(start, end)| *at >= start && *at < end);

        let mut stats = Statistics::default();
        for d in state.detections.iter().filter(|d| in_range(&d.at)) {
            stats.record(&d.object_type, d.at.date_naive(), d.duplicates, 0);
        }
        for m in state.merges.iter().filter(|m| in_range(&m.at)) {
            stats.record(&m.object_type, m.at.date_naive(), 0, m.merged);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::MasterStrategy;
    use chrono::TimeZone;

    fn account_config() -> MatchConfiguration {
        MatchConfiguration {
            id: "acct".into(),
            label: "Accounts".into(),
            developer_name: "Accounts".into(),
            object_type: "Account".into(),
            match_fields: vec!["Name".into(), "Phone".into()],
            required_fields: vec![],
            field_labels: BTreeMap::new(),
            master_strategy: MasterStrategy::OldestCreated,
            batch_size: 200,
            active: true,
        }
    }

    fn account(id: &str, day: u32, name: &str, phone: &str) -> RecordSnapshot {
        RecordSnapshot::new(id, Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap())
            .with_field("Name", name)
            .with_field("Phone", phone)
    }

    fn backend() -> InMemoryBackend {
        let backend = InMemoryBackend::new(Arc::new(ManualClock::new(1_700_000_000_000)));
        backend.add_configuration(account_config());
        backend.insert_record("Account", account("001", 1, "Acme", "555"));
        backend.insert_record("Account", account("002", 2, " acme ", "555"));
        backend.insert_record("Account", account("003", 3, "Globex", "777"));
        backend
    }

    #[tokio::test]
    async fn test_dry_run_advances_per_poll_and_detects_pairs() {
        let backend = backend();
        let job = backend.submit_job("acct", true, 200).await.unwrap();

        assert_eq!(backend.job_status(&job).await.unwrap().status, JobStatus::Running);
        let done = backend.job_status(&job).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.records_processed, 3);
        assert_eq!(done.duplicates_found, 1);

        let groups = backend.list_groups(&job).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_member("001") && groups[0].is_member("002"));
        // Dry runs leave records alone.
        assert_eq!(backend.record_count("Account"), 3);
    }

    #[tokio::test]
    async fn test_merge_job_reports_merges() {
        let backend = backend();
        let job = backend.submit_job("acct", false, 200).await.unwrap();
        backend.job_status(&job).await.unwrap();
        let done = backend.job_status(&job).await.unwrap();
        assert_eq!(done.merges.len(), 1);
        assert_eq!(done.merges[0].master_id, "001");
        assert_eq!(done.merges[0].merged_ids, vec!["002"]);
        assert_eq!(backend.record_count("Account"), 2);
    }

    #[tokio::test]
    async fn test_merge_records_applies_values_and_rejects_replays() {
        let backend = backend();
        let call = MergeCall {
            object_type: "Account".into(),
            master_id: "001".into(),
            duplicate_ids: vec!["002".into()],
            field_values: BTreeMap::from([("Phone".to_string(), serde_json::json!("999"))]),
            idempotency_key: "001|002".into(),
        };
        let outcome = backend.merge_records(&call).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.merged_id.as_deref(), Some("001"));
        assert!(backend.record("Account", "002").is_none());
        assert_eq!(
            backend.record("Account", "001").unwrap().fields["Phone"],
            serde_json::json!("999")
        );

        let err = backend.merge_records(&call).await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_consumed_once() {
        let backend = backend();
        backend.fail_next(Operation::SubmitJob, RemoteError::Network("offline".into()));
        assert!(backend.submit_job("acct", true, 200).await.is_err());
        assert!(backend.submit_job("acct", true, 200).await.is_ok());
        assert_eq!(backend.call_count(Operation::SubmitJob), 2);
    }

    #[tokio::test]
    async fn test_schedules() {
        let backend = backend();
        let spec = ScheduleSpec {
            config_id: "acct".into(),
            cron_expression: "0 0 3 * * ?".into(),
            job_name: "nightly".into(),
            is_dry_run: true,
            batch_size: 200,
        };
        let id = backend.schedule_job(&spec).await.unwrap();
        assert!(backend.schedule_job(&spec).await.is_err());

        let job = backend.fire_schedule(&id).unwrap();
        assert_eq!(backend.job_status(&job).await.unwrap().status, JobStatus::Running);

        backend.delete_schedule(&id).await.unwrap();
        assert!(backend.list_schedules().await.unwrap().is_empty());
        assert!(backend.delete_schedule(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_statistics_follow_activity() {
        let backend = backend();
        let job = backend.submit_job("acct", false, 200).await.unwrap();
        backend.job_status(&job).await.unwrap();
        backend.job_status(&job).await.unwrap();

        let stats = backend.get_statistics(DateRange::Today).await.unwrap();
        assert_eq!(stats.duplicates_found, 1);
        assert_eq!(stats.records_merged, 1);
        assert_eq!(stats.by_object["Account"].records_merged, 1);
    }
}
