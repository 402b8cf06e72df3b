//! Core types for the dedupe engine.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};

pub type RecordId = String;
pub type GroupId = String;
pub type JobId = String;

/// Strategy used to pick the surviving record of a duplicate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MasterStrategy {
    /// Earliest `created_at` wins.
    #[default]
    OldestCreated,
    /// Most populated fields wins.
    MostComplete,
    /// Latest `modified_at` wins.
    MostRecent,
}

impl MasterStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasterStrategy::OldestCreated => "OldestCreated",
            MasterStrategy::MostComplete => "MostComplete",
            MasterStrategy::MostRecent => "MostRecent",
        }
    }
}

impl fmt::Display for MasterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MasterStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['_', '-', ' '], "").as_str() {
            "oldestcreated" | "oldest" => Ok(MasterStrategy::OldestCreated),
            "mostcomplete" | "complete" => Ok(MasterStrategy::MostComplete),
            "mostrecent" | "recent" | "mostrecentlymodified" => Ok(MasterStrategy::MostRecent),
            _ => Err(EngineError::configuration(format!(
                "Unknown master strategy: {}",
                s
            ))),
        }
    }
}

/// A declarative matching rule set, as resolved from the configuration source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchConfiguration {
    pub id: String,
    pub label: String,
    pub developer_name: String,
    pub object_type: String,
    /// Ordered, de-duplicated field names.
    pub match_fields: Vec<String>,
    /// Fields that must resolve to a value before a merge can be submitted.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Display labels keyed by field name.
    #[serde(default)]
    pub field_labels: BTreeMap<String, String>,
    pub master_strategy: MasterStrategy,
    pub batch_size: u32,
    pub active: bool,
}

impl MatchConfiguration {
    /// Display label for a field, falling back to the field name.
    pub fn label_for<'a>(&'a self, field: &'a str) -> &'a str {
        self.field_labels
            .get(field)
            .map(String::as_str)
            .unwrap_or(field)
    }
}

/// A cluster of records believed to represent one real-world entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: GroupId,
    pub object_type: String,
    pub member_record_ids: BTreeSet<RecordId>,
    /// Match confidence, 0-100.
    pub match_score: u8,
    pub master_record_id: Option<RecordId>,
    #[serde(default)]
    pub excluded: bool,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub expanded: bool,
}

impl DuplicateGroup {
    pub fn new(
        id: impl Into<GroupId>,
        object_type: impl Into<String>,
        members: impl IntoIterator<Item = impl Into<RecordId>>,
        match_score: u8,
    ) -> Self {
        Self {
            id: id.into(),
            object_type: object_type.into(),
            member_record_ids: members.into_iter().map(Into::into).collect(),
            match_score: match_score.min(100),
            master_record_id: None,
            excluded: false,
            flagged: false,
            expanded: false,
        }
    }

    pub fn is_member(&self, record_id: &str) -> bool {
        self.member_record_ids.contains(record_id)
    }

    /// Members other than the master, in ascending id order.
    pub fn duplicate_ids(&self) -> Vec<RecordId> {
        self.member_record_ids
            .iter()
            .filter(|id| Some(*id) != self.master_record_id.as_ref())
            .cloned()
            .collect()
    }

    /// Check the master-membership invariant.
    pub fn validate(&self) -> EngineResult<()> {
        if self.member_record_ids.is_empty() {
            return Err(EngineError::validation(format!(
                "Duplicate group {} has no members",
                self.id
            )));
        }
        if let Some(ref master) = self.master_record_id
            && !self.is_member(master)
        {
            return Err(EngineError::validation(format!(
                "Master {} is not a member of group {}",
                master, self.id
            ))
            .with_fields(["masterRecordId"]));
        }
        Ok(())
    }
}

/// True when a field value counts as absent: null, or a blank string.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Render a field value for human-readable summaries.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Point-in-time field values of one record, loaded from the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl RecordSnapshot {
    pub fn new(id: impl Into<RecordId>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            modified_at: created_at,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_modified(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = modified_at;
        self
    }

    /// Non-blank value of a field.
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|v| !is_blank(v))
    }

    /// Number of non-blank fields.
    pub fn populated_count(&self) -> usize {
        self.fields.values().filter(|v| !is_blank(v)).count()
    }
}

/// Resolution outcome of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    Unchanged,
    Filled,
    Conflict,
}

/// Computed value and status for one field across a duplicate group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResolution {
    pub field_name: String,
    pub label: String,
    pub master_value: Option<Value>,
    /// Distinct non-master values that differ from the resolved base.
    pub candidate_values: Vec<Value>,
    pub status: ResolutionStatus,
    pub chosen_value: Option<Value>,
    /// Set when an operator picked the value explicitly.
    #[serde(default)]
    pub explicitly_chosen: bool,
}

impl FieldResolution {
    /// Conflict not yet settled by an explicit choice.
    pub fn is_unresolved_conflict(&self) -> bool {
        self.status == ResolutionStatus::Conflict && !self.explicitly_chosen
    }
}

/// Lifecycle status of a merge job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Draft,
    Queued,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Draft => "Draft",
            JobStatus::Queued => "Queued",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(JobStatus::Draft),
            "queued" | "holding" | "preparing" => Ok(JobStatus::Queued),
            "running" | "processing" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            _ => Err(EngineError::validation(format!("Unknown job status: {}", s))),
        }
    }
}

/// A dry-run or merge job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeJob {
    pub id: JobId,
    pub config_id: String,
    #[serde(default)]
    pub object_type: Option<String>,
    pub is_dry_run: bool,
    pub batch_size: u32,
    pub status: JobStatus,
    #[serde(default)]
    pub records_processed: u64,
    #[serde(default)]
    pub duplicates_found: u64,
    #[serde(default)]
    pub error_messages: Vec<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
}

impl MergeJob {
    /// A job in the `Draft` state, not yet known to the batch executor.
    pub fn draft(draft: &DraftJob, is_dry_run: bool) -> Self {
        Self {
            id: String::new(),
            config_id: draft.config_id.clone(),
            object_type: Some(draft.object_type.clone()),
            is_dry_run,
            batch_size: draft.batch_size,
            status: JobStatus::Draft,
            records_processed: 0,
            duplicates_found: 0,
            error_messages: Vec::new(),
            submitted_at: None,
            completion_time: None,
        }
    }
}

/// The in-progress, not yet submitted job configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftJob {
    pub config_id: String,
    pub object_type: String,
    pub batch_size: u32,
    pub match_fields: Vec<String>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl DraftJob {
    pub fn from_configuration(config: &MatchConfiguration) -> Self {
        Self {
            config_id: config.id.clone(),
            object_type: config.object_type.clone(),
            batch_size: config.batch_size,
            match_fields: config.match_fields.clone(),
            saved_at: None,
        }
    }
}

/// A recurring job registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub config_id: String,
    pub cron_expression: String,
    pub job_name: String,
    pub is_dry_run: bool,
    pub batch_size: u32,
}

/// Append-only audit entry written once per successful merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeLog {
    pub id: String,
    pub job_id: Option<JobId>,
    pub config_id: Option<String>,
    pub object_type: String,
    pub master_id: RecordId,
    pub merged_ids: Vec<RecordId>,
    pub field_resolutions: Vec<FieldResolution>,
    pub note: Option<String>,
    pub initiator: String,
    pub execution_time: DateTime<Utc>,
}

/// Outcome of a merge submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub merged_id: Option<RecordId>,
    pub errors: Vec<String>,
    /// Audit entry id, when one was written.
    #[serde(default)]
    pub log_id: Option<String>,
}

impl MergeResult {
    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            success: false,
            merged_id: None,
            errors,
            log_id: None,
        }
    }
}

/// Relative date window for audit queries and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DateRange {
    Today,
    Yesterday,
    ThisWeek,
    ThisMonth,
    LastMonth,
    ThisYear,
    #[default]
    All,
}

impl DateRange {
    /// Half-open `[start, end)` bounds in UTC, or `None` for `All`.
    /// Weeks start on Monday.
    pub fn bounds(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let today = now.date_naive();
        let (start, end) = match self {
            DateRange::All => return None,
            DateRange::Today => (today, today + Duration::days(1)),
            DateRange::Yesterday => (today - Duration::days(1), today),
            DateRange::ThisWeek => {
                let offset = today.weekday().num_days_from_monday() as i64;
                let start = today - Duration::days(offset);
                (start, start + Duration::days(7))
            }
            DateRange::ThisMonth => {
                let start = first_of_month(today.year(), today.month());
                (start, next_month(start))
            }
            DateRange::LastMonth => {
                let this_month = first_of_month(today.year(), today.month());
                let start = previous_month(this_month);
                (start, this_month)
            }
            DateRange::ThisYear => (
                first_of_month(today.year(), 1),
                first_of_month(today.year() + 1, 1),
            ),
        };
        Some((midnight(start), midnight(end)))
    }
}

impl FromStr for DateRange {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "TODAY" => Ok(DateRange::Today),
            "YESTERDAY" => Ok(DateRange::Yesterday),
            "THIS_WEEK" => Ok(DateRange::ThisWeek),
            "THIS_MONTH" => Ok(DateRange::ThisMonth),
            "LAST_MONTH" => Ok(DateRange::LastMonth),
            "THIS_YEAR" => Ok(DateRange::ThisYear),
            "ALL" => Ok(DateRange::All),
            _ => Err(EngineError::validation(format!("Unknown date range: {}", s))),
        }
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_default()
}

fn next_month(date: NaiveDate) -> NaiveDate {
    if date.month() == 12 {
        first_of_month(date.year() + 1, 1)
    } else {
        first_of_month(date.year(), date.month() + 1)
    }
}

fn previous_month(date: NaiveDate) -> NaiveDate {
    if date.month() == 1 {
        first_of_month(date.year() - 1, 12)
    } else {
        first_of_month(date.year(), date.month() - 1)
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// Audit-log query parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeLogQuery {
    pub object_type: Option<String>,
    pub config_id: Option<String>,
    pub page_size: u32,
    /// 1-based.
    pub page_number: u32,
    pub date_range: DateRange,
}

impl Default for MergeLogQuery {
    fn default() -> Self {
        Self {
            object_type: None,
            config_id: None,
            page_size: DEFAULT_PAGE_SIZE,
            page_number: 1,
            date_range: DateRange::All,
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page_size: u32,
    pub page_number: u32,
    pub total_records: u64,
    pub total_pages: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_number: 1,
            total_records: 0,
            total_pages: 0,
        }
    }
}

impl Pagination {
    pub fn new(page_size: u32, page_number: u32, total_records: u64) -> Self {
        let page_size = page_size.max(1);
        let total_pages = total_records.div_ceil(page_size as u64) as u32;
        Self {
            page_size,
            page_number: page_number.max(1),
            total_records,
            total_pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergeLogPage {
    pub records: Vec<MergeLog>,
    pub pagination: Pagination,
}

/// One day of a trend series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectStats {
    pub duplicates_found: u64,
    pub records_merged: u64,
}

/// Aggregate duplicate/merge statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub duplicates_found: u64,
    pub records_merged: u64,
    pub duplicates_trend: Vec<TrendPoint>,
    pub merges_trend: Vec<TrendPoint>,
    pub by_object: BTreeMap<String, ObjectStats>,
}

impl Statistics {
    /// Fold one finished job into the aggregates.
    pub fn record(&mut self, object_type: &str, date: NaiveDate, duplicates: u64, merged: u64) {
        self.duplicates_found += duplicates;
        self.records_merged += merged;

        let entry = self.by_object.entry(object_type.to_string()).or_default();
        entry.duplicates_found += duplicates;
        entry.records_merged += merged;

        if duplicates > 0 {
            bump_trend(&mut self.duplicates_trend, date, duplicates);
        }
        if merged > 0 {
            bump_trend(&mut self.merges_trend, date, merged);
        }
    }
}

fn bump_trend(trend: &mut Vec<TrendPoint>, date: NaiveDate, count: u64) {
    match trend.binary_search_by_key(&date, |p| p.date) {
        Ok(idx) => trend[idx].count += count,
        Err(idx) => trend.insert(idx, TrendPoint { date, count }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_master_strategy_parsing() {
        assert_eq!(
            "OldestCreated".parse::<MasterStrategy>().unwrap(),
            MasterStrategy::OldestCreated
        );
        assert_eq!(
            "most_complete".parse::<MasterStrategy>().unwrap(),
            MasterStrategy::MostComplete
        );
        assert_eq!(
            "Most Recent".parse::<MasterStrategy>().unwrap(),
            MasterStrategy::MostRecent
        );
        assert!("Random".parse::<MasterStrategy>().is_err());
    }

    #[test]
    fn test_group_validate_rejects_foreign_master() {
        let mut group = DuplicateGroup::new("g1", "Account", ["a", "b"], 90);
        assert!(group.validate().is_ok());

        group.master_record_id = Some("z".to_string());
        let err = group.validate().unwrap_err();
        assert!(err.is_validation());

        group.master_record_id = Some("b".to_string());
        assert!(group.validate().is_ok());
        assert_eq!(group.duplicate_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn test_blank_values() {
        assert!(is_blank(&Value::Null));
        assert!(is_blank(&json!("   ")));
        assert!(!is_blank(&json!("x")));
        assert!(!is_blank(&json!(0)));
        assert!(!is_blank(&json!(false)));
    }

    #[test]
    fn test_snapshot_value_skips_blank() {
        let snap = RecordSnapshot::new("a", Utc::now())
            .with_field("Name", "Acme")
            .with_field("Phone", Value::Null)
            .with_field("City", "");
        assert_eq!(snap.value("Name"), Some(&json!("Acme")));
        assert_eq!(snap.value("Phone"), None);
        assert_eq!(snap.value("City"), None);
        assert_eq!(snap.value("Missing"), None);
        assert_eq!(snap.populated_count(), 1);
    }

    #[test]
    fn test_date_range_bounds() {
        // Wednesday 2024-05-15
        let now = Utc.with_ymd_and_hms(2024, 5, 15, 13, 30, 0).unwrap();
        let day = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap();

        assert_eq!(DateRange::All.bounds(now), None);
        assert_eq!(
            DateRange::Today.bounds(now),
            Some((day(2024, 5, 15), day(2024, 5, 16)))
        );
        assert_eq!(
            DateRange::Yesterday.bounds(now),
            Some((day(2024, 5, 14), day(2024, 5, 15)))
        );
        assert_eq!(
            DateRange::ThisWeek.bounds(now),
            Some((day(2024, 5, 13), day(2024, 5, 20)))
        );
        assert_eq!(
            DateRange::ThisMonth.bounds(now),
            Some((day(2024, 5, 1), day(2024, 6, 1)))
        );
        assert_eq!(
            DateRange::LastMonth.bounds(now),
            Some((day(2024, 4, 1), day(2024, 5, 1)))
        );
        assert_eq!(
            DateRange::ThisYear.bounds(now),
            Some((day(2024, 1, 1), day(2025, 1, 1)))
        );
    }

    #[test]
    fn test_last_month_wraps_year() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let (start, end) = DateRange::LastMonth.bounds(now).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_date_range_parse() {
        assert_eq!("this-week".parse::<DateRange>().unwrap(), DateRange::ThisWeek);
        assert_eq!("LAST_MONTH".parse::<DateRange>().unwrap(), DateRange::LastMonth);
        assert!("NEXT_YEAR".parse::<DateRange>().is_err());
    }

    #[test]
    fn test_pagination_pages() {
        let p = Pagination::new(10, 2, 25);
        assert_eq!(p.total_pages, 3);
        assert_eq!(Pagination::new(10, 1, 0).total_pages, 0);
        assert_eq!(Pagination::new(0, 0, 5).page_size, 1);
    }

    #[test]
    fn test_statistics_record_accumulates() {
        let mut stats = Statistics::default();
        let d1 = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();

        stats.record("Account", d2, 3, 0);
        stats.record("Account", d1, 1, 2);
        stats.record("Contact", d2, 2, 2);

        assert_eq!(stats.duplicates_found, 6);
        assert_eq!(stats.records_merged, 4);
        assert_eq!(stats.by_object["Account"].duplicates_found, 4);
        assert_eq!(stats.by_object["Contact"].records_merged, 2);
        assert_eq!(
            stats.duplicates_trend,
            vec![
                TrendPoint { date: d1, count: 1 },
                TrendPoint { date: d2, count: 5 }
            ]
        );
        assert_eq!(stats.merges_trend.len(), 2);
    }
}
