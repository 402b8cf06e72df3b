//! Job orchestration.
//!
//! The [`JobOrchestrator`] owns the draft slot, submits dry-run and merge jobs
//! to the [`BatchExecutor`], observes them through polling until they reach a
//! terminal state, and manages recurring schedules. Every outcome flows into
//! the session [`Store`]; remote failures are normalized and reported there as
//! well as returned.
//!
//! Terminal jobs are handled once:
//! - the job is recorded in the audit database,
//! - merges reported by a non-dry-run job are appended to the audit log,
//! - statistics are updated and the `jobs` section is invalidated,
//! - groups of a completed dry run are loaded for review.

pub mod schedule;
pub mod state;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use schedule::{ScheduleRequest, ScheduleTiming, daily_cron, validate_batch_size, validate_cron};
pub use state::{TransitionError, can_transition, transition};

use crate::backend::{BatchExecutor, JobProgress};
use crate::config::JobsConfig;
use crate::drafts::BestEffortDrafts;
use crate::error::{EngineError, EngineResult};
use crate::executor::{AuditLog, MergeExecutor, MergeRequest};
use crate::resolver::ConfigurationResolver;
use crate::store::{Action, Section, Store};
use crate::types::{
    DateRange, DraftJob, DuplicateGroup, GroupId, JobId, JobStatus, MatchConfiguration, MergeJob,
    MergeLog, MergeLogPage, MergeLogQuery, MergeResult, ScheduledJob, Statistics,
};

pub struct JobOrchestrator {
    store: Arc<Store>,
    resolver: Arc<ConfigurationResolver>,
    executor: Arc<dyn BatchExecutor>,
    audit: Arc<dyn AuditLog>,
    drafts: BestEffortDrafts,
    config: JobsConfig,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<Store>,
        resolver: Arc<ConfigurationResolver>,
        executor: Arc<dyn BatchExecutor>,
        audit: Arc<dyn AuditLog>,
        drafts: BestEffortDrafts,
    ) -> Self {
        Self {
            store,
            resolver,
            executor,
            audit,
            drafts,
            config: JobsConfig::default(),
        }
    }

    pub fn with_config(mut self, config: JobsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // Configurations

    /// Active configurations, served from the store while the section is fresh.
    pub async fn load_configurations(&self, force: bool) -> EngineResult<Vec<MatchConfiguration>> {
        if !force && self.store.lookup(Section::Configurations) {
            debug!("Configurations served from cache");
            return Ok(self.store.get_state().configurations.clone());
        }
        self.store
            .dispatch(Action::SectionPending(Section::Configurations));
        match self.resolver.list_active_configurations() {
            Ok(configs) => {
                self.store
                    .dispatch(Action::ConfigurationsLoaded(configs.clone()));
                Ok(configs)
            }
            Err(e) => {
                self.store
                    .dispatch(Action::SectionInvalidated(Section::Configurations));
                Err(self.fail(e))
            }
        }
    }

    /// Select a configuration and start a draft from it.
    pub fn select_configuration(&self, config_id: &str) -> EngineResult<DraftJob> {
        let cached = self.store.get_state().configuration(config_id).cloned();
        let config = match cached {
            Some(config) => config,
            None => self.resolver.find(config_id).map_err(|e| self.fail(e))?,
        };
        self.store
            .dispatch(Action::ConfigurationSelected(Some(config.id.clone())));
        self.save_draft(DraftJob::from_configuration(&config))
    }

    /// The selected configuration.
    pub fn selected_configuration(&self) -> EngineResult<MatchConfiguration> {
        self.store
            .get_state()
            .selected()
            .cloned()
            .ok_or_else(|| EngineError::configuration("No matching configuration selected"))
    }

    // Draft slot

    /// Put `draft` in the slot and persist it. Persistence failures are logged
    /// only; the in-store draft is still updated.
    pub fn save_draft(&self, mut draft: DraftJob) -> EngineResult<DraftJob> {
        validate_batch_size(draft.batch_size, self.config.max_batch_size)
            .map_err(|e| self.fail(e))?;
        draft.saved_at = Some(self.store.clock().now());
        self.store.dispatch(Action::DraftSaved(draft.clone()));
        self.drafts.save(&draft);
        Ok(draft)
    }

    /// Restore a persisted draft into the store, if there is one.
    pub fn restore_draft(&self) -> Option<DraftJob> {
        let draft = self.drafts.load()?;
        debug!(config_id = %draft.config_id, "Restored persisted draft");
        self.store.dispatch(Action::DraftSaved(draft.clone()));
        Some(draft)
    }

    pub fn discard_draft(&self) {
        self.store.dispatch(Action::DraftCleared);
        self.drafts.clear();
    }

    // Submission and observation

    /// Submit the draft as a dry-run or merge job.
    ///
    /// The draft is validated locally first. If the executor cannot be reached
    /// the job stays a draft, the error is reported and nothing is retried.
    pub async fn submit(&self, is_dry_run: bool) -> EngineResult<MergeJob> {
        let draft = self.store.get_state().draft_job.clone().ok_or_else(|| {
            self.fail(EngineError::validation("No draft job to submit").with_fields(["draftJob"]))
        })?;
        validate_batch_size(draft.batch_size, self.config.max_batch_size)
            .map_err(|e| self.fail(e))?;
        if draft.match_fields.is_empty() {
            return Err(self.fail(EngineError::missing_fields(&["matchFields".to_string()])));
        }
        self.resolver
            .find(&draft.config_id)
            .map_err(|e| self.fail(e))?;

        let mut job = MergeJob::draft(&draft, is_dry_run);
        let job_id = match self
            .executor
            .submit_job(&draft.config_id, is_dry_run, draft.batch_size)
            .await
        {
            Ok(id) => id,
            Err(remote) => {
                warn!(config_id = %draft.config_id, "Job submission failed, keeping draft: {}", remote);
                return Err(self.fail(remote.into()));
            }
        };

        job.id = job_id;
        transition(&mut job, JobStatus::Queued).map_err(EngineError::internal)?;
        job.submitted_at = Some(self.store.clock().now());
        self.store.dispatch(Action::JobUpserted(job.clone()));
        self.discard_draft();

        info!(job_id = %job.id, dry_run = is_dry_run, batch_size = job.batch_size, "Job submitted");
        Ok(job)
    }

    /// Ids of submitted jobs that have not finished.
    pub fn pending_job_ids(&self) -> Vec<JobId> {
        self.store
            .get_state()
            .active_jobs
            .iter()
            .filter(|j| !j.id.is_empty() && j.status != JobStatus::Draft && !j.status.is_terminal())
            .map(|j| j.id.clone())
            .collect()
    }

    /// Poll every unfinished job once. Returns the jobs whose state changed.
    pub async fn poll_jobs(&self) -> Vec<MergeJob> {
        let mut updated = Vec::new();
        for job_id in self.pending_job_ids() {
            match self.executor.job_status(&job_id).await {
                Ok(progress) => {
                    if let Some(job) = self.observe(progress).await {
                        updated.push(job);
                    }
                }
                Err(e) => {
                    self.fail(e.into());
                }
            }
        }
        updated
    }

    /// Apply one observed progress report.
    ///
    /// Unknown jobs and illegal transitions are logged and ignored. A job is
    /// finalized the first time it is seen in a terminal state; audit entries
    /// and statistics are written by whichever instance sharing the audit
    /// database records the job first.
    pub async fn observe(&self, progress: JobProgress) -> Option<MergeJob> {
        let mut job = self.store.get_state().job(&progress.job_id).cloned()?;
        if job.status.is_terminal() {
            debug!(job_id = %job.id, "Ignoring progress for finished job");
            return None;
        }
        if let Err(e) = transition(&mut job, progress.status) {
            warn!("{}", e);
            return None;
        }
        progress.apply_to(&mut job);

        if job.status.is_terminal() {
            job.completion_time = Some(self.store.clock().now());
            self.store.dispatch(Action::JobUpserted(job.clone()));
            self.finish(&job, &progress).await;
        } else if !self.store.dispatch(Action::JobUpserted(job.clone())) {
            return None;
        }
        Some(job)
    }

    async fn finish(&self, job: &MergeJob, progress: &JobProgress) {
        let now = self.store.clock().now();
        info!(
            job_id = %job.id,
            status = %job.status,
            processed = job.records_processed,
            duplicates = job.duplicates_found,
            "Job finished"
        );

        match job.status {
            JobStatus::Completed => {
                if job.records_processed == 0 {
                    self.store
                        .post_notice(format!("Job {} processed no records", job.id));
                }
                if !job.error_messages.is_empty() {
                    self.store.report_error(
                        &EngineError::partial(format!(
                            "Job {} completed with {} record errors out of {} records processed",
                            job.id,
                            job.error_messages.len(),
                            job.records_processed
                        ))
                        .with_details(job.error_messages.join("; ")),
                    );
                }
            }
            JobStatus::Failed => {
                let mut err = EngineError::remote(format!("Job {} failed", job.id));
                if !job.error_messages.is_empty() {
                    err = err.with_details(job.error_messages.join("; "));
                }
                self.store.report_error(&err);
            }
            JobStatus::Aborted => {
                self.store.post_notice(format!("Job {} was aborted", job.id));
            }
            _ => {}
        }

        let logs: Vec<MergeLog> = if job.is_dry_run {
            Vec::new()
        } else {
            progress
                .merges
                .iter()
                .map(|merge| MergeLog {
                    id: uuid::Uuid::new_v4().to_string(),
                    job_id: Some(job.id.clone()),
                    config_id: Some(job.config_id.clone()),
                    object_type: merge.object_type.clone(),
                    master_id: merge.master_id.clone(),
                    merged_ids: merge.merged_ids.clone(),
                    field_resolutions: Vec::new(),
                    note: None,
                    initiator: format!("job:{}", job.id),
                    execution_time: now,
                })
                .collect()
        };
        let merged: u64 = logs.iter().map(|log| log.merged_ids.len() as u64).sum();

        let claimed = match self.audit.finalize_job(job, &logs, now) {
            Ok(claimed) => claimed,
            Err(e) => {
                self.store.report_error(&EngineError::internal(format!(
                    "Failed to record job {}: {}",
                    job.id, e
                )));
                true
            }
        };
        if !claimed {
            debug!(job_id = %job.id, "Job already finalized by another instance");
            return;
        }

        let completed_dry_run = job.is_dry_run && job.status == JobStatus::Completed;
        let duplicates = if completed_dry_run { job.duplicates_found } else { 0 };
        if duplicates > 0 || merged > 0 {
            self.store.dispatch(Action::StatisticsRecorded {
                object_type: job.object_type.clone().unwrap_or_default(),
                date: now.date_naive(),
                duplicates_found: duplicates,
                records_merged: merged,
            });
        }
        self.store
            .dispatch(Action::SectionInvalidated(Section::Jobs));
        if merged > 0 {
            self.store
                .dispatch(Action::SectionInvalidated(Section::MergeLogs));
        }

        if completed_dry_run
            && job.duplicates_found > 0
            && let Err(e) = self.load_groups(&job.id).await
        {
            debug!(job_id = %job.id, "Groups not loaded: {}", e);
        }
    }

    /// Reload jobs and schedules from the executor unless the section is fresh.
    pub async fn refresh_jobs(&self, force: bool) -> EngineResult<()> {
        if !force && self.store.lookup(Section::Jobs) {
            return Ok(());
        }
        self.store.dispatch(Action::SectionPending(Section::Jobs));
        let loaded = async {
            let active = self.executor.list_jobs().await?;
            let scheduled = self.executor.list_schedules().await?;
            Ok::<_, crate::backend::RemoteError>((active, scheduled))
        }
        .await;
        match loaded {
            Ok((active, scheduled)) => {
                self.store
                    .dispatch(Action::JobsLoaded { active, scheduled });
                Ok(())
            }
            Err(e) => {
                self.store
                    .dispatch(Action::SectionInvalidated(Section::Jobs));
                Err(self.fail(e.into()))
            }
        }
    }

    /// Statistics from the executor for `range`.
    pub async fn refresh_statistics(&self, range: DateRange, force: bool) -> EngineResult<Statistics> {
        if !force && self.store.lookup(Section::Statistics) {
            return Ok(self.store.get_state().statistics.clone());
        }
        self.store
            .dispatch(Action::SectionPending(Section::Statistics));
        match self.executor.get_statistics(range).await {
            Ok(stats) => {
                self.store
                    .dispatch(Action::StatisticsLoaded(stats.clone()));
                Ok(stats)
            }
            Err(e) => {
                self.store
                    .dispatch(Action::SectionInvalidated(Section::Statistics));
                Err(self.fail(e.into()))
            }
        }
    }

    /// Statistics computed from the local audit database.
    pub fn local_statistics(&self, range: DateRange) -> EngineResult<Statistics> {
        self.audit
            .statistics(range, self.store.clock().now())
            .map_err(|e| self.fail(e.into()))
    }

    // Schedules

    /// Register a recurring job. The request is validated before the executor
    /// is contacted.
    pub async fn schedule(&self, request: &ScheduleRequest) -> EngineResult<ScheduledJob> {
        let spec = request
            .to_spec(self.config.max_batch_size)
            .map_err(|e| self.fail(e))?;
        let id = self
            .executor
            .schedule_job(&spec)
            .await
            .map_err(|e| self.fail(e.into()))?;

        let scheduled = ScheduledJob {
            id,
            config_id: spec.config_id,
            cron_expression: spec.cron_expression,
            job_name: spec.job_name,
            is_dry_run: spec.is_dry_run,
            batch_size: spec.batch_size,
        };
        info!(schedule_id = %scheduled.id, cron = %scheduled.cron_expression, "Job scheduled");
        self.store
            .dispatch(Action::ScheduleAdded(scheduled.clone()));
        Ok(scheduled)
    }

    pub async fn delete_schedule(&self, schedule_id: &str) -> EngineResult<()> {
        self.executor
            .delete_schedule(schedule_id)
            .await
            .map_err(|e| self.fail(e.into()))?;
        self.store
            .dispatch(Action::ScheduleRemoved(schedule_id.to_string()));
        info!(schedule_id = %schedule_id, "Schedule deleted");
        Ok(())
    }

    // Groups

    /// Load the duplicate groups found by a dry run into the store.
    pub async fn load_groups(&self, job_id: &str) -> EngineResult<Vec<DuplicateGroup>> {
        self.store.dispatch(Action::SectionPending(Section::Groups));
        match self.executor.list_groups(job_id).await {
            Ok(groups) => {
                debug!(job_id = %job_id, count = groups.len(), "Groups loaded");
                self.store.dispatch(Action::GroupsLoaded(groups.clone()));
                Ok(groups)
            }
            Err(e) => {
                self.store
                    .dispatch(Action::SectionInvalidated(Section::Groups));
                Err(self.fail(e.into()))
            }
        }
    }

    pub fn exclude_group(&self, group_id: &str, excluded: bool) -> bool {
        self.store.dispatch(Action::GroupExcluded {
            group_id: group_id.to_string(),
            excluded,
        })
    }

    pub fn flag_group(&self, group_id: &str, flagged: bool) -> bool {
        self.store.dispatch(Action::GroupFlagged {
            group_id: group_id.to_string(),
            flagged,
        })
    }

    pub fn expand_group(&self, group_id: &str, expanded: bool) -> bool {
        self.store.dispatch(Action::GroupExpanded {
            group_id: group_id.to_string(),
            expanded,
        })
    }

    /// Override the master of a loaded group.
    pub fn set_group_master(&self, group_id: &str, record_id: &str) -> EngineResult<()> {
        let mut group = self
            .store
            .get_state()
            .groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| EngineError::validation(format!("Unknown duplicate group {}", group_id)))?;
        crate::master::set_master(&mut group, record_id).map_err(|e| self.fail(e))?;
        self.store.dispatch(Action::GroupMasterSet {
            group_id: group.id,
            record_id: record_id.to_string(),
        });
        Ok(())
    }

    /// Merge every non-excluded group of the selected configuration's object
    /// type, one group at a time.
    pub async fn merge_selected(
        &self,
        merger: &MergeExecutor,
        initiator: &str,
    ) -> EngineResult<Vec<(GroupId, EngineResult<MergeResult>)>> {
        let config = self.selected_configuration().map_err(|e| self.fail(e))?;
        let groups: Vec<DuplicateGroup> = self
            .store
            .get_state()
            .mergeable_groups()
            .into_iter()
            .filter(|g| g.object_type == config.object_type)
            .cloned()
            .collect();

        let mut outcomes = Vec::with_capacity(groups.len());
        for mut group in groups {
            let result = self.merge_one(merger, &mut group, &config, initiator).await;
            if let Err(ref e) = result {
                warn!(group_id = %group.id, "Group not merged: {}", e);
            }
            outcomes.push((group.id, result));
        }
        Ok(outcomes)
    }

    async fn merge_one(
        &self,
        merger: &MergeExecutor,
        group: &mut DuplicateGroup,
        config: &MatchConfiguration,
        initiator: &str,
    ) -> EngineResult<MergeResult> {
        let preview = merger.preview_group(group, config).await?;
        let request = MergeRequest::from_group(group, &preview, config, initiator)?;
        merger.submit_merge(&request).await
    }

    // Audit log

    pub fn load_merge_logs(&self, query: &MergeLogQuery) -> EngineResult<MergeLogPage> {
        self.store.dispatch(Action::PageRequested {
            page_number: query.page_number,
            page_size: query.page_size,
        });
        let page = self
            .audit
            .list_merge_logs(query, self.store.clock().now())
            .map_err(|e| self.fail(e.into()))?;
        self.store.dispatch(Action::MergeLogsLoaded(page.clone()));
        Ok(page)
    }

    fn fail(&self, err: EngineError) -> EngineError {
        self.store.report_error(&err);
        err
    }
}

/// Poll unfinished jobs every `poll_interval_ms` until the task is aborted.
pub fn spawn_poll_loop(orchestrator: Arc<JobOrchestrator>) -> JoinHandle<()> {
    let period = Duration::from_millis(orchestrator.config.poll_interval_ms.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if orchestrator.pending_job_ids().is_empty() {
                continue;
            }
            let updated = orchestrator.poll_jobs().await;
            if !updated.is_empty() {
                debug!("{} jobs updated by poll", updated.len());
            }
        }
    })
}
