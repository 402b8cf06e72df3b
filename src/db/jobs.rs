//! Terminal job history.

use super::Database;
use super::merge_logs::insert_log;
use crate::types::{DateRange, JobStatus, MergeJob, MergeLog};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

/// Write one job_history row with the given conflict clause; returns rows changed.
fn write_job(
    conn: &Connection,
    conflict: &str,
    job: &MergeJob,
    completed_at: DateTime<Utc>,
) -> Result<usize> {
    let errors = serde_json::to_string(&job.error_messages)?;
    let completion = job.completion_time.unwrap_or(completed_at);
    let changed = conn.execute(
        &format!(
            "INSERT OR {} INTO job_history (id, config_id, object_type, is_dry_run, batch_size,
                status, records_processed, duplicates_found, error_messages, completion_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            conflict
        ),
        params![
            job.id,
            job.config_id,
            job.object_type,
            job.is_dry_run,
            job.batch_size,
            job.status.as_str(),
            job.records_processed as i64,
            job.duplicates_found as i64,
            errors,
            completion.timestamp_millis(),
        ],
    )?;
    Ok(changed)
}

impl Database {
    /// Record a job that reached a terminal state. Re-recording the same job
    /// replaces the earlier row.
    pub fn record_job(&self, job: &MergeJob, completed_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| write_job(conn, "REPLACE", job, completed_at).map(|_| ()))
    }

    /// Record a terminal job together with the merges it reported, once.
    ///
    /// Returns `false` without writing anything when the job is already in
    /// the history, so instances sharing this database finalize a job at
    /// most once between them.
    pub fn finalize_job(
        &self,
        job: &MergeJob,
        merges: &[MergeLog],
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            if write_job(&tx, "IGNORE", job, completed_at)? == 0 {
                return Ok(false);
            }
            for log in merges {
                insert_log(&tx, log)?;
            }
            tx.commit()?;
            Ok(true)
        })
    }

    /// Jobs completed within `range`, newest first.
    pub fn job_history(&self, range: DateRange, now: DateTime<Utc>) -> Result<Vec<MergeJob>> {
        let (start, end) = match range.bounds(now) {
            Some((start, end)) => (start.timestamp_millis(), end.timestamp_millis()),
            None => (i64::MIN, i64::MAX),
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, config_id, object_type, is_dry_run, batch_size, status,
                    records_processed, duplicates_found, error_messages, completion_time
                 FROM job_history
                 WHERE completion_time >= ?1 AND completion_time < ?2
                 ORDER BY completion_time DESC, id",
            )?;
            let jobs = stmt
                .query_map(params![start, end], |row| {
                    let status: String = row.get(5)?;
                    let errors: String = row.get(8)?;
                    let completion: i64 = row.get(9)?;
                    let processed: i64 = row.get(6)?;
                    let found: i64 = row.get(7)?;
                    Ok(MergeJob {
                        id: row.get(0)?,
                        config_id: row.get(1)?,
                        object_type: row.get(2)?,
                        is_dry_run: row.get(3)?,
                        batch_size: row.get(4)?,
                        status: status.parse().unwrap_or(JobStatus::Failed),
                        records_processed: processed.max(0) as u64,
                        duplicates_found: found.max(0) as u64,
                        error_messages: serde_json::from_str(&errors).unwrap_or_default(),
                        submitted_at: None,
                        completion_time: DateTime::<Utc>::from_timestamp_millis(completion),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })
    }

    /// Duplicates found by completed dry runs within `range`.
    pub fn duplicates_found(&self, range: DateRange, now: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .job_history(range, now)?
            .iter()
            .filter(|j| j.is_dry_run && j.status == JobStatus::Completed)
            .map(|j| j.duplicates_found)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn job(id: &str, dry_run: bool, status: JobStatus, found: u64) -> MergeJob {
        MergeJob {
            id: id.into(),
            config_id: "acct".into(),
            object_type: Some("Account".into()),
            is_dry_run: dry_run,
            batch_size: 200,
            status,
            records_processed: 10,
            duplicates_found: found,
            error_messages: vec!["row 3: locked".into()],
            submitted_at: None,
            completion_time: None,
        }
    }

    #[test]
    fn test_record_and_query() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 12, 12, 0, 0).unwrap();

        db.record_job(&job("j1", true, JobStatus::Completed, 4), now).unwrap();
        db.record_job(&job("j2", true, JobStatus::Failed, 9), now).unwrap();
        db.record_job(&job("j3", false, JobStatus::Completed, 2), now).unwrap();
        db.record_job(
            &job("j4", true, JobStatus::Completed, 5),
            now - Duration::days(2),
        )
        .unwrap();

        let today = db.job_history(DateRange::Today, now).unwrap();
        assert_eq!(today.len(), 3);
        assert_eq!(today[0].error_messages, vec!["row 3: locked"]);
        assert_eq!(today[0].completion_time, Some(now));

        assert_eq!(db.duplicates_found(DateRange::Today, now).unwrap(), 4);
        assert_eq!(db.duplicates_found(DateRange::All, now).unwrap(), 9);
    }

    #[test]
    fn test_rerecord_replaces() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 12, 12, 0, 0).unwrap();
        db.record_job(&job("j1", true, JobStatus::Completed, 1), now).unwrap();
        db.record_job(&job("j1", true, JobStatus::Completed, 3), now).unwrap();
        let all = db.job_history(DateRange::All, now).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].duplicates_found, 3);
    }

    fn merge(id: &str, job_id: &str, master: &str) -> MergeLog {
        MergeLog {
            id: id.into(),
            job_id: Some(job_id.into()),
            config_id: Some("acct".into()),
            object_type: "Account".into(),
            master_id: master.into(),
            merged_ids: vec![format!("{}-dup", master)],
            field_resolutions: Vec::new(),
            note: None,
            initiator: format!("job:{}", job_id),
            execution_time: Utc.with_ymd_and_hms(2024, 6, 12, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_finalize_job_claims_once() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 12, 12, 0, 0).unwrap();
        let finished = job("j1", false, JobStatus::Completed, 0);

        let first = [merge("l1", "j1", "m1"), merge("l2", "j1", "m2")];
        assert!(db.finalize_job(&finished, &first, now).unwrap());

        let second = [merge("l3", "j1", "m1"), merge("l4", "j1", "m2")];
        assert!(!db.finalize_job(&finished, &second, now).unwrap());

        assert_eq!(db.job_history(DateRange::All, now).unwrap().len(), 1);
        assert!(db.get_merge_log("l1").unwrap().is_some());
        assert!(db.get_merge_log("l3").unwrap().is_none());
        assert_eq!(db.merge_statistics(DateRange::All, now).unwrap().records_merged, 2);
    }
}
