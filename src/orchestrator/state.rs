//! Job lifecycle state machine.
//!
//! ```text
//! Draft ──► Queued ──► Running ──► Completed
//!              │          │    └─► Failed
//!              └──────────┴──────► Aborted / Failed / Completed
//! ```
//!
//! A queued job may be observed already finished, so `Queued` can move
//! straight to any terminal state. Terminal states are final.

use thiserror::Error;

use crate::types::{JobStatus, MergeJob};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal job transition {from} -> {to} for job {job_id}")]
pub struct TransitionError {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Whether `from -> to` is a legal lifecycle step. Staying put is not a step.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Draft, Queued)
            | (Queued, Running)
            | (Queued, Completed)
            | (Queued, Failed)
            | (Queued, Aborted)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Aborted)
    )
}

/// Move `job` to `to`. Returns `Ok(false)` when it is already there.
pub fn transition(job: &mut MergeJob, to: JobStatus) -> Result<bool, TransitionError> {
    if job.status == to {
        return Ok(false);
    }
    if !can_transition(job.status, to) {
        return Err(TransitionError {
            job_id: job.id.clone(),
            from: job.status,
            to,
        });
    }
    job.status = to;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DraftJob;

    fn job() -> MergeJob {
        MergeJob::draft(
            &DraftJob {
                config_id: "acct".into(),
                object_type: "Account".into(),
                batch_size: 200,
                match_fields: vec!["Name".into()],
                saved_at: None,
            },
            true,
        )
    }

    #[test]
    fn test_happy_path() {
        let mut job = job();
        assert!(transition(&mut job, JobStatus::Queued).unwrap());
        assert!(transition(&mut job, JobStatus::Running).unwrap());
        assert!(!transition(&mut job, JobStatus::Running).unwrap());
        assert!(transition(&mut job, JobStatus::Completed).unwrap());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut job = job();
        job.status = JobStatus::Failed;
        let err = transition(&mut job, JobStatus::Running).unwrap_err();
        assert_eq!(err.from, JobStatus::Failed);
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_draft_cannot_skip_queue() {
        assert!(!can_transition(JobStatus::Draft, JobStatus::Running));
        assert!(!can_transition(JobStatus::Running, JobStatus::Queued));
        assert!(can_transition(JobStatus::Queued, JobStatus::Completed));
    }
}
