//! Merge execution.
//!
//! [`MergeExecutor::submit_merge`] validates a request locally, hands the
//! mutation to the [`RecordStore`], and on success appends exactly one
//! [`MergeLog`] entry. Progress is published on the session bus as
//! [`MergeOperationEvent`]s sharing one correlation id.
//!
//! A group can have at most one merge in flight per executor. Every call also
//! carries an idempotency key derived from the master and the sorted
//! duplicates, so a store can refuse a merge another session already applied.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::backend::{MergeCall, RecordStore};
use crate::db::Database;
use crate::error::{EngineError, EngineResult};
use crate::master::ensure_master;
use crate::preview::{MergePreview, preview_for_configuration};
use crate::store::{Action, BusEvent, MergeOperationEvent, MergePhase, Section, Store};
use crate::types::{
    DateRange, DuplicateGroup, FieldResolution, GroupId, JobId, MatchConfiguration, MergeJob,
    MergeLog, MergeLogPage, MergeLogQuery, MergeResult, RecordId, RecordSnapshot, Statistics,
    is_blank,
};

/// Destination of audit entries and terminal job records.
pub trait AuditLog: Send + Sync {
    fn append_merge(&self, log: &MergeLog) -> anyhow::Result<()>;
    /// Record a terminal job and the merges it reported. Returns `false` when
    /// the job was already finalized, in which case nothing is written.
    fn finalize_job(
        &self,
        job: &MergeJob,
        merges: &[MergeLog],
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;
    fn list_merge_logs(
        &self,
        query: &MergeLogQuery,
        now: DateTime<Utc>,
    ) -> anyhow::Result<MergeLogPage>;
    fn statistics(&self, range: DateRange, now: DateTime<Utc>) -> anyhow::Result<Statistics>;
}

impl AuditLog for Database {
    fn append_merge(&self, log: &MergeLog) -> anyhow::Result<()> {
        self.insert_merge_log(log)
    }

    fn finalize_job(
        &self,
        job: &MergeJob,
        merges: &[MergeLog],
        completed_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        Database::finalize_job(self, job, merges, completed_at)
    }

    fn list_merge_logs(
        &self,
        query: &MergeLogQuery,
        now: DateTime<Utc>,
    ) -> anyhow::Result<MergeLogPage> {
        Database::list_merge_logs(self, query, now)
    }

    fn statistics(&self, range: DateRange, now: DateTime<Utc>) -> anyhow::Result<Statistics> {
        let mut stats = self.merge_statistics(range, now)?;
        stats.duplicates_found = self.duplicates_found(range, now)?;
        Ok(stats)
    }
}

/// A merge ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    pub group_id: Option<GroupId>,
    pub object_type: String,
    pub master_id: RecordId,
    pub duplicate_ids: Vec<RecordId>,
    /// Group membership the master and duplicates must come from. Empty for
    /// ad-hoc requests that name records directly.
    pub member_ids: BTreeSet<RecordId>,
    pub resolutions: Vec<FieldResolution>,
    pub required_fields: Vec<String>,
    pub config_id: Option<String>,
    pub job_id: Option<JobId>,
    pub note: Option<String>,
    pub initiator: String,
}

impl MergeRequest {
    /// Build a request from a group with a master and its preview.
    ///
    /// The preview must have been computed for this group and its current
    /// master; a preview taken before a master change is refused.
    pub fn from_group(
        group: &DuplicateGroup,
        preview: &MergePreview,
        config: &MatchConfiguration,
        initiator: impl Into<String>,
    ) -> EngineResult<Self> {
        group.validate()?;
        let master_id = group.master_record_id.clone().ok_or_else(|| {
            EngineError::validation(format!("Group {} has no master record", group.id))
                .with_fields(["masterRecordId"])
        })?;
        if preview.group_id != group.id {
            return Err(EngineError::validation(format!(
                "Preview belongs to group {}, not {}",
                preview.group_id, group.id
            )));
        }
        if preview.master_id != master_id {
            return Err(EngineError::validation(format!(
                "Preview was computed for master {} but the group master is {}",
                preview.master_id, master_id
            ))
            .with_fields(["masterRecordId"]));
        }
        Ok(Self {
            group_id: Some(group.id.clone()),
            object_type: group.object_type.clone(),
            master_id,
            duplicate_ids: group.duplicate_ids(),
            member_ids: group.member_record_ids.clone(),
            resolutions: preview.resolutions.clone(),
            required_fields: config.required_fields.clone(),
            config_id: Some(config.id.clone()),
            job_id: None,
            note: preview
                .has_conflicts
                .then(|| preview.conflict_summary.clone()),
            initiator: initiator.into(),
        })
    }

    /// Local checks run before any remote call.
    pub fn validate(&self) -> EngineResult<()> {
        if self.master_id.trim().is_empty() {
            return Err(EngineError::validation("A master record is required")
                .with_fields(["masterRecordId"]));
        }
        if self.duplicate_ids.is_empty() {
            return Err(EngineError::validation("At least one duplicate record is required")
                .with_fields(["duplicateIds"]));
        }
        if self.duplicate_ids.contains(&self.master_id) {
            return Err(EngineError::validation(format!(
                "Master {} is also listed as a duplicate",
                self.master_id
            ))
            .with_fields(["duplicateIds"]));
        }
        let distinct: BTreeSet<&RecordId> = self.duplicate_ids.iter().collect();
        if distinct.len() != self.duplicate_ids.len() {
            return Err(EngineError::validation("Duplicate ids must be distinct")
                .with_fields(["duplicateIds"]));
        }
        if !self.member_ids.is_empty() {
            if !self.member_ids.contains(&self.master_id) {
                return Err(EngineError::validation(format!(
                    "Master {} is not a member of the group",
                    self.master_id
                ))
                .with_fields(["masterRecordId"]));
            }
            if let Some(outsider) = self
                .duplicate_ids
                .iter()
                .find(|id| !self.member_ids.contains(*id))
            {
                return Err(EngineError::validation(format!(
                    "Duplicate {} is not a member of the group",
                    outsider
                ))
                .with_fields(["duplicateIds"]));
            }
        }

        let missing: Vec<String> = self
            .required_fields
            .iter()
            .filter(|field| !self.has_resolved_value(field))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::missing_fields(&missing));
        }
        Ok(())
    }

    fn has_resolved_value(&self, field: &str) -> bool {
        self.resolutions
            .iter()
            .find(|r| r.field_name == field)
            .is_some_and(|r| {
                !r.is_unresolved_conflict() && r.chosen_value.as_ref().is_some_and(|v| !is_blank(v))
            })
    }

    /// Stable key for this logical merge.
    pub fn idempotency_key(&self) -> String {
        let mut duplicates = self.duplicate_ids.clone();
        duplicates.sort();
        format!(
            "{}:{}|{}",
            self.object_type,
            self.master_id,
            duplicates.join(",")
        )
    }

    /// Values to write onto the master: explicit choices and fills.
    fn field_values(&self) -> BTreeMap<String, Value> {
        self.resolutions
            .iter()
            .filter(|r| r.explicitly_chosen || r.master_value.is_none())
            .filter_map(|r| Some((r.field_name.clone(), r.chosen_value.clone()?)))
            .collect()
    }

    fn guard_key(&self) -> String {
        self.group_id
            .clone()
            .unwrap_or_else(|| self.idempotency_key())
    }
}

/// Releases the in-flight mark on drop.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, key: String) -> Option<Self> {
        let mut active = set.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(key.clone()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            key,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut active = self.set.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.key);
    }
}

pub struct MergeExecutor {
    records: Arc<dyn RecordStore>,
    audit: Arc<dyn AuditLog>,
    store: Arc<Store>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl MergeExecutor {
    pub fn new(records: Arc<dyn RecordStore>, audit: Arc<dyn AuditLog>, store: Arc<Store>) -> Self {
        Self {
            records,
            audit,
            store,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a merge for `group_id` is currently running.
    pub fn is_in_flight(&self, group_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(group_id)
    }

    /// Snapshots of every member of `group`, keyed by id.
    pub async fn load_snapshots(
        &self,
        group: &DuplicateGroup,
    ) -> EngineResult<BTreeMap<RecordId, RecordSnapshot>> {
        let ids: Vec<RecordId> = group.member_record_ids.iter().cloned().collect();
        let snapshots = self
            .records
            .load_records(&group.object_type, &ids)
            .await
            .map_err(|e| self.fail(e.into()))?;
        Ok(snapshots.into_iter().map(|s| (s.id.clone(), s)).collect())
    }

    /// Load the group's records, settle its master and compute the preview.
    /// A newly selected master is recorded in the store.
    pub async fn preview_group(
        &self,
        group: &mut DuplicateGroup,
        config: &MatchConfiguration,
    ) -> EngineResult<MergePreview> {
        let snapshots = self.load_snapshots(group).await?;
        let had_master = group.master_record_id.clone();
        let master = ensure_master(group, config.master_strategy, &snapshots)
            .map_err(|e| self.fail(e))?;
        if had_master.as_deref() != Some(master.as_str()) {
            self.store.dispatch(Action::GroupMasterSet {
                group_id: group.id.clone(),
                record_id: master.clone(),
            });
        }
        preview_for_configuration(config, group, &master, &snapshots).map_err(|e| self.fail(e))
    }

    /// Submit one merge.
    ///
    /// Validation failures and a concurrent submission for the same group are
    /// returned as errors without contacting the store. Store failures come
    /// back as an unsuccessful [`MergeResult`].
    pub async fn submit_merge(&self, request: &MergeRequest) -> EngineResult<MergeResult> {
        request.validate().map_err(|e| self.fail(e))?;

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, request.guard_key()) else {
            return Err(self.fail(EngineError::validation(format!(
                "A merge is already in progress for {}",
                request.guard_key()
            ))));
        };

        let correlation_id = uuid::Uuid::new_v4().to_string();
        self.emit(&correlation_id, MergePhase::Starting, request, None, Vec::new());
        info!(
            master_id = %request.master_id,
            duplicates = request.duplicate_ids.len(),
            "Submitting merge"
        );

        let call = MergeCall {
            object_type: request.object_type.clone(),
            master_id: request.master_id.clone(),
            duplicate_ids: request.duplicate_ids.clone(),
            field_values: request.field_values(),
            idempotency_key: request.idempotency_key(),
        };

        let outcome = match self.records.merge_records(&call).await {
            Ok(outcome) if outcome.success => outcome,
            Ok(outcome) => {
                let errors = if outcome.errors.is_empty() {
                    vec!["Merge was not applied".to_string()]
                } else {
                    outcome.errors
                };
                self.fail(EngineError::remote(errors.join("; ")));
                self.emit(&correlation_id, MergePhase::Error, request, None, errors.clone());
                return Ok(MergeResult::failed(errors));
            }
            Err(remote) => {
                let err: EngineError = remote.into();
                let message = err.message.clone();
                self.fail(err);
                self.emit(&correlation_id, MergePhase::Error, request, None, vec![message.clone()]);
                return Ok(MergeResult::failed(vec![message]));
            }
        };

        let merged_id = outcome
            .merged_id
            .clone()
            .unwrap_or_else(|| request.master_id.clone());
        let now = self.store.clock().now();
        let log = MergeLog {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: request.job_id.clone(),
            config_id: request.config_id.clone(),
            object_type: request.object_type.clone(),
            master_id: request.master_id.clone(),
            merged_ids: request.duplicate_ids.clone(),
            field_resolutions: request.resolutions.clone(),
            note: request.note.clone(),
            initiator: request.initiator.clone(),
            execution_time: now,
        };
        let log_id = match self.audit.append_merge(&log) {
            Ok(()) => Some(log.id.clone()),
            Err(e) => {
                error!(master_id = %request.master_id, "Merge applied but audit entry failed: {}", e);
                self.fail(EngineError::internal(format!("Audit log write failed: {}", e)));
                None
            }
        };

        if let Some(ref group_id) = request.group_id {
            self.store.dispatch(Action::GroupMerged(group_id.clone()));
        }
        self.store.dispatch(Action::StatisticsRecorded {
            object_type: request.object_type.clone(),
            date: now.date_naive(),
            duplicates_found: 0,
            records_merged: request.duplicate_ids.len() as u64,
        });
        self.store
            .dispatch(Action::SectionInvalidated(Section::MergeLogs));

        self.emit(
            &correlation_id,
            MergePhase::Completed,
            request,
            Some(merged_id.clone()),
            Vec::new(),
        );
        info!(merged_id = %merged_id, "Merge completed");

        Ok(MergeResult {
            success: true,
            merged_id: Some(merged_id),
            errors: Vec::new(),
            log_id,
        })
    }

    /// Submit merges one after another. Each call starts only after the
    /// previous one has settled; a failure does not stop the batch.
    pub async fn merge_groups(&self, requests: &[MergeRequest]) -> Vec<EngineResult<MergeResult>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self.submit_merge(request).await;
            if let Err(ref e) = result {
                warn!(master_id = %request.master_id, "Bulk merge entry rejected: {}", e);
            }
            results.push(result);
        }
        results
    }

    fn emit(
        &self,
        correlation_id: &str,
        phase: MergePhase,
        request: &MergeRequest,
        merged_id: Option<RecordId>,
        errors: Vec<String>,
    ) {
        self.store.publish(BusEvent::MergeOperation(MergeOperationEvent {
            correlation_id: correlation_id.to_string(),
            phase,
            group_id: request.group_id.clone(),
            master_id: request.master_id.clone(),
            duplicate_ids: request.duplicate_ids.clone(),
            merged_id,
            errors,
        }));
    }

    /// Report to the store and hand the error back.
    fn fail(&self, err: EngineError) -> EngineError {
        self.store.report_error(&err);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResolutionStatus;
    use serde_json::json;

    fn resolution(field: &str, status: ResolutionStatus, chosen: Option<Value>) -> FieldResolution {
        FieldResolution {
            field_name: field.to_string(),
            label: field.to_string(),
            master_value: chosen.clone(),
            candidate_values: vec![],
            status,
            chosen_value: chosen,
            explicitly_chosen: false,
        }
    }

    fn request() -> MergeRequest {
        MergeRequest {
            group_id: Some("g1".into()),
            object_type: "Account".into(),
            master_id: "a".into(),
            duplicate_ids: vec!["c".into(), "b".into()],
            member_ids: ["a", "b", "c"].into_iter().map(String::from).collect(),
            resolutions: vec![resolution(
                "Name",
                ResolutionStatus::Unchanged,
                Some(json!("Acme")),
            )],
            required_fields: vec!["Name".into()],
            config_id: Some("acct".into()),
            job_id: None,
            note: None,
            initiator: "tester".into(),
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_master_in_duplicates_rejected() {
        let mut req = request();
        req.duplicate_ids.push("a".into());
        assert!(req.validate().unwrap_err().is_validation());
    }

    #[test]
    fn test_master_outside_members_rejected() {
        let mut req = request();
        req.master_id = "z".into();
        let err = req.validate().unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.fields, vec!["masterRecordId"]);

        let mut req = request();
        req.duplicate_ids.push("y".into());
        assert_eq!(req.validate().unwrap_err().fields, vec!["duplicateIds"]);
    }

    #[test]
    fn test_unknown_membership_skips_member_check() {
        let mut req = request();
        req.member_ids.clear();
        req.master_id = "z".into();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_empty_duplicates_rejected() {
        let mut req = request();
        req.duplicate_ids.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_missing_required_fields_are_named() {
        let mut req = request();
        req.required_fields = vec!["Name".into(), "Industry".into(), "Phone".into()];
        req.resolutions.push(resolution("Phone", ResolutionStatus::Unchanged, None));
        let err = req.validate().unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.fields, vec!["Industry", "Phone"]);
    }

    #[test]
    fn test_unresolved_required_conflict_blocks_until_chosen() {
        let mut req = request();
        req.resolutions[0].status = ResolutionStatus::Conflict;
        assert_eq!(req.validate().unwrap_err().fields, vec!["Name"]);

        req.resolutions[0].explicitly_chosen = true;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_idempotency_key_sorts_duplicates() {
        let req = request();
        assert_eq!(req.idempotency_key(), "Account:a|b,c");

        let mut reordered = request();
        reordered.duplicate_ids.reverse();
        assert_eq!(reordered.idempotency_key(), req.idempotency_key());
    }

    #[test]
    fn test_field_values_carry_fills_and_choices() {
        let mut req = request();
        let mut filled = resolution("City", ResolutionStatus::Filled, Some(json!("Oslo")));
        filled.master_value = None;
        let mut chosen = resolution("Phone", ResolutionStatus::Conflict, Some(json!("2")));
        chosen.master_value = Some(json!("1"));
        chosen.explicitly_chosen = true;
        req.resolutions.extend([filled, chosen]);

        let values = req.field_values();
        assert_eq!(values.len(), 2);
        assert_eq!(values["City"], json!("Oslo"));
        assert_eq!(values["Phone"], json!("2"));
    }

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let set = Arc::new(Mutex::new(HashSet::new()));
        let guard = InFlightGuard::acquire(&set, "g1".into()).unwrap();
        assert!(InFlightGuard::acquire(&set, "g1".into()).is_none());
        drop(guard);
        assert!(InFlightGuard::acquire(&set, "g1".into()).is_some());
    }
}
