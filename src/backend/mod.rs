//! External collaborators: the record store and the batch job executor.
//!
//! The engine never talks to a concrete backend directly. Implementations of
//! [`RecordStore`] and [`BatchExecutor`] are injected; [`memory`] provides an
//! in-process implementation of both.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::{EngineError, ErrorCode};
use crate::types::{
    DateRange, DuplicateGroup, JobId, JobStatus, MergeJob, RecordId, RecordSnapshot, ScheduledJob,
    Statistics,
};

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

impl From<RemoteError> for EngineError {
    fn from(err: RemoteError) -> Self {
        let code = match err {
            RemoteError::AccessDenied(_) => ErrorCode::Access,
            _ => ErrorCode::RemoteExecution,
        };
        EngineError::new(code, err.to_string())
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// A merge as sent to the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCall {
    pub object_type: String,
    pub master_id: RecordId,
    pub duplicate_ids: Vec<RecordId>,
    /// Values to write onto the master before the duplicates are merged in.
    #[serde(default)]
    pub field_values: BTreeMap<String, Value>,
    /// Stable key for this logical merge; stores reject a key they have
    /// already applied.
    pub idempotency_key: String,
}

/// Record store's answer to a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub merged_id: Option<RecordId>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn merge_records(&self, call: &MergeCall) -> RemoteResult<MergeOutcome>;

    /// Snapshots for the given ids. Unknown ids are omitted.
    async fn load_records(
        &self,
        object_type: &str,
        ids: &[RecordId],
    ) -> RemoteResult<Vec<RecordSnapshot>>;
}

/// A merge performed by a batch job, reported so it can be audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedMerge {
    pub object_type: String,
    pub master_id: RecordId,
    pub merged_ids: Vec<RecordId>,
}

/// Point-in-time job status from the batch executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub status: JobStatus,
    pub records_processed: u64,
    pub duplicates_found: u64,
    #[serde(default)]
    pub error_messages: Vec<String>,
    #[serde(default)]
    pub merges: Vec<CompletedMerge>,
}

impl JobProgress {
    /// Copy the observed counters onto `job`.
    pub fn apply_to(&self, job: &mut MergeJob) {
        job.records_processed = self.records_processed;
        job.duplicates_found = self.duplicates_found;
        job.error_messages = self.error_messages.clone();
    }
}

/// Recurring job registration as sent to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub config_id: String,
    pub cron_expression: String,
    pub job_name: String,
    pub is_dry_run: bool,
    pub batch_size: u32,
}

#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn submit_job(
        &self,
        config_id: &str,
        is_dry_run: bool,
        batch_size: u32,
    ) -> RemoteResult<JobId>;

    async fn job_status(&self, job_id: &str) -> RemoteResult<JobProgress>;

    async fn list_jobs(&self) -> RemoteResult<Vec<MergeJob>>;

    /// Duplicate groups detected by a finished dry run.
    async fn list_groups(&self, job_id: &str) -> RemoteResult<Vec<DuplicateGroup>>;

    async fn schedule_job(&self, spec: &ScheduleSpec) -> RemoteResult<String>;

    async fn delete_schedule(&self, schedule_id: &str) -> RemoteResult<()>;

    async fn list_schedules(&self) -> RemoteResult<Vec<ScheduledJob>>;

    async fn get_statistics(&self, range: DateRange) -> RemoteResult<Statistics>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_codes() {
        let err: EngineError = RemoteError::AccessDenied("Account.Phone".into()).into();
        assert_eq!(err.code, ErrorCode::Access);

        let err: EngineError = RemoteError::Network("timed out".into()).into();
        assert_eq!(err.code, ErrorCode::RemoteExecution);
        assert_eq!(err.message, "network failure: timed out");
    }
}
