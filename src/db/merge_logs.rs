//! Append-only merge audit log.

use super::Database;
use crate::types::{
    DateRange, MergeLog, MergeLogPage, MergeLogQuery, Pagination, Statistics, TrendPoint,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ToSql, params};

/// WHERE clause and parameters for the shared audit filters.
struct Filter {
    clause: String,
    params: Vec<Box<dyn ToSql>>,
}

impl Filter {
    fn build(
        object_type: Option<&str>,
        config_id: Option<&str>,
        range: DateRange,
        now: DateTime<Utc>,
    ) -> Self {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(object_type) = object_type {
            params.push(Box::new(object_type.to_string()));
            conditions.push(format!("object_type = ?{}", params.len()));
        }
        if let Some(config_id) = config_id {
            params.push(Box::new(config_id.to_string()));
            conditions.push(format!("config_id = ?{}", params.len()));
        }
        if let Some((start, end)) = range.bounds(now) {
            params.push(Box::new(start.timestamp_millis()));
            conditions.push(format!("execution_time >= ?{}", params.len()));
            params.push(Box::new(end.timestamp_millis()));
            conditions.push(format!("execution_time < ?{}", params.len()));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        Self { clause, params }
    }

    fn refs(&self) -> Vec<&dyn ToSql> {
        self.params.iter().map(|p| p.as_ref()).collect()
    }
}

impl Database {
    /// Append one merge log entry.
    pub fn insert_merge_log(&self, log: &MergeLog) -> Result<()> {
        self.with_conn(|conn| insert_log(conn, log))
    }

    pub fn get_merge_log(&self, id: &str) -> Result<Option<MergeLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, config_id, object_type, master_id, merged_ids,
                    field_resolutions, note, initiator, execution_time
                 FROM merge_logs WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map(params![id], Self::map_merge_log)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }

    /// Page through the audit log, newest first.
    pub fn list_merge_logs(&self, query: &MergeLogQuery, now: DateTime<Utc>) -> Result<MergeLogPage> {
        let filter = Filter::build(
            query.object_type.as_deref(),
            query.config_id.as_deref(),
            query.date_range,
            now,
        );
        let page_size = query.page_size.max(1);
        let page_number = query.page_number.max(1);

        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM merge_logs {}", filter.clause),
                filter.refs().as_slice(),
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT id, job_id, config_id, object_type, master_id, merged_ids,
                    field_resolutions, note, initiator, execution_time
                 FROM merge_logs {}
                 ORDER BY execution_time DESC, id
                 LIMIT {} OFFSET {}",
                filter.clause,
                page_size,
                (page_number as i64 - 1) * page_size as i64
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map(filter.refs().as_slice(), Self::map_merge_log)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(MergeLogPage {
                records,
                pagination: Pagination::new(page_size, page_number, total.max(0) as u64),
            })
        })
    }

    /// Merge counts from the audit log: totals, per object type and a daily
    /// trend (UTC days).
    pub fn merge_statistics(&self, range: DateRange, now: DateTime<Utc>) -> Result<Statistics> {
        let filter = Filter::build(None, None, range, now);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT object_type, merged_count, execution_time FROM merge_logs {}
                 ORDER BY execution_time",
                filter.clause
            ))?;
            let rows = stmt
                .query_map(filter.refs().as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stats = Statistics::default();
            for (object_type, merged, at) in rows {
                let date = DateTime::<Utc>::from_timestamp_millis(at)
                    .map(|d| d.date_naive())
                    .unwrap_or_default();
                stats.record(&object_type, date, 0, merged.max(0) as u64);
            }
            Ok(stats)
        })
    }

    /// Records merged per day, oldest first.
    pub fn merge_trend(&self, range: DateRange, now: DateTime<Utc>) -> Result<Vec<TrendPoint>> {
        Ok(self.merge_statistics(range, now)?.merges_trend)
    }

    fn map_merge_log(row: &rusqlite::Row) -> rusqlite::Result<MergeLog> {
        let merged_ids: String = row.get(5)?;
        let resolutions: String = row.get(6)?;
        let execution_ms: i64 = row.get(9)?;
        Ok(MergeLog {
            id: row.get(0)?,
            job_id: row.get(1)?,
            config_id: row.get(2)?,
            object_type: row.get(3)?,
            master_id: row.get(4)?,
            merged_ids: serde_json::from_str(&merged_ids).unwrap_or_default(),
            field_resolutions: serde_json::from_str(&resolutions).unwrap_or_default(),
            note: row.get(7)?,
            initiator: row.get(8)?,
            execution_time: DateTime::<Utc>::from_timestamp_millis(execution_ms)
                .unwrap_or_default(),
        })
    }
}

/// Insert one entry on an open connection or transaction.
pub(super) fn insert_log(conn: &Connection, log: &MergeLog) -> Result<()> {
    let merged_ids = serde_json::to_string(&log.merged_ids)?;
    let resolutions = serde_json::to_string(&log.field_resolutions)?;
    conn.execute(
        "INSERT INTO merge_logs (id, job_id, config_id, object_type, master_id, merged_ids,
            merged_count, field_resolutions, note, initiator, execution_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            log.id,
            log.job_id,
            log.config_id,
            log.object_type,
            log.master_id,
            merged_ids,
            log.merged_ids.len() as i64,
            resolutions,
            log.note,
            log.initiator,
            log.execution_time.timestamp_millis(),
        ],
    )?;
    Ok(())
}
