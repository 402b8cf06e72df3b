//! Store state and the actions that transition it.
//!
//! Every [`Action`] names at most one [`Section`]. [`reduce`] applies an
//! action to a state value and reports whether anything changed; it never
//! performs I/O.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

use super::cache::Section;
use crate::error::ErrorRecord;
use crate::types::{
    DraftJob, DuplicateGroup, GroupId, MatchConfiguration, MergeJob, MergeLog, MergeLogPage,
    Pagination, RecordId, ScheduledJob, Statistics,
};

/// Informational message, e.g. a job that scanned zero records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub message: String,
    pub timestamp: i64,
}

/// Aggregate root of one session's client-side state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub configurations: Vec<MatchConfiguration>,
    pub selected_configuration: Option<String>,
    pub scheduled_jobs: Vec<ScheduledJob>,
    pub active_jobs: Vec<MergeJob>,
    pub statistics: Statistics,
    /// Most recent errors, oldest first.
    pub errors: VecDeque<ErrorRecord>,
    pub notices: VecDeque<Notice>,
    pub pagination: Pagination,
    pub merge_logs: Vec<MergeLog>,
    pub draft_job: Option<DraftJob>,
    pub groups: BTreeMap<GroupId, DuplicateGroup>,
}

impl StoreState {
    pub fn job(&self, id: &str) -> Option<&MergeJob> {
        self.active_jobs.iter().find(|j| j.id == id)
    }

    pub fn configuration(&self, id: &str) -> Option<&MatchConfiguration> {
        self.configurations.iter().find(|c| c.id == id)
    }

    pub fn selected(&self) -> Option<&MatchConfiguration> {
        self.selected_configuration
            .as_deref()
            .and_then(|id| self.configuration(id))
    }

    /// Groups that would take part in a bulk merge, in id order.
    pub fn mergeable_groups(&self) -> Vec<&DuplicateGroup> {
        self.groups.values().filter(|g| !g.excluded).collect()
    }
}

/// A single state transition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    ConfigurationsLoaded(Vec<MatchConfiguration>),
    ConfigurationSelected(Option<String>),
    JobsLoaded {
        active: Vec<MergeJob>,
        scheduled: Vec<ScheduledJob>,
    },
    JobUpserted(MergeJob),
    ScheduleAdded(ScheduledJob),
    ScheduleRemoved(String),
    StatisticsLoaded(Statistics),
    StatisticsRecorded {
        object_type: String,
        date: NaiveDate,
        duplicates_found: u64,
        records_merged: u64,
    },
    GroupsLoaded(Vec<DuplicateGroup>),
    GroupExcluded {
        group_id: GroupId,
        excluded: bool,
    },
    GroupFlagged {
        group_id: GroupId,
        flagged: bool,
    },
    GroupExpanded {
        group_id: GroupId,
        expanded: bool,
    },
    GroupMasterSet {
        group_id: GroupId,
        record_id: RecordId,
    },
    GroupMerged(GroupId),
    GroupsCleared,
    MergeLogsLoaded(MergeLogPage),
    PageRequested {
        page_number: u32,
        page_size: u32,
    },
    DraftSaved(DraftJob),
    DraftCleared,
    ErrorRaised(ErrorRecord),
    ErrorDismissed(String),
    ErrorsCleared,
    NoticePosted(Notice),
    SectionPending(Section),
    SectionInvalidated(Section),
    Reset,
}

impl Action {
    /// The section this action touches. `Reset` touches every section.
    pub fn section(&self) -> Option<Section> {
        match self {
            Action::ConfigurationsLoaded(_) | Action::ConfigurationSelected(_) => {
                Some(Section::Configurations)
            }
            Action::JobsLoaded { .. }
            | Action::JobUpserted(_)
            | Action::ScheduleAdded(_)
            | Action::ScheduleRemoved(_) => Some(Section::Jobs),
            Action::StatisticsLoaded(_) | Action::StatisticsRecorded { .. } => {
                Some(Section::Statistics)
            }
            Action::GroupsLoaded(_)
            | Action::GroupExcluded { .. }
            | Action::GroupFlagged { .. }
            | Action::GroupExpanded { .. }
            | Action::GroupMasterSet { .. }
            | Action::GroupMerged(_)
            | Action::GroupsCleared => Some(Section::Groups),
            Action::MergeLogsLoaded(_) | Action::PageRequested { .. } => Some(Section::MergeLogs),
            Action::DraftSaved(_) | Action::DraftCleared => Some(Section::Draft),
            Action::ErrorRaised(_)
            | Action::ErrorDismissed(_)
            | Action::ErrorsCleared
            | Action::NoticePosted(_) => Some(Section::Notifications),
            Action::SectionPending(section) | Action::SectionInvalidated(section) => {
                Some(*section)
            }
            Action::Reset => None,
        }
    }

    /// Whether applying the action makes its section fresh.
    pub fn refreshes_cache(&self) -> bool {
        !matches!(
            self,
            Action::SectionPending(_) | Action::SectionInvalidated(_) | Action::Reset
        )
    }

    /// Whether other instances of the session should apply this action too.
    /// Notifications, cache bookkeeping and paging stay local.
    pub fn is_shared(&self) -> bool {
        !matches!(
            self.section(),
            Some(Section::Notifications) | Some(Section::MergeLogs) | None
        ) && !matches!(self, Action::SectionPending(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::ConfigurationsLoaded(_) => "CONFIGURATIONS_LOADED",
            Action::ConfigurationSelected(_) => "CONFIGURATION_SELECTED",
            Action::JobsLoaded { .. } => "JOBS_LOADED",
            Action::JobUpserted(_) => "JOB_UPSERTED",
            Action::ScheduleAdded(_) => "SCHEDULE_ADDED",
            Action::ScheduleRemoved(_) => "SCHEDULE_REMOVED",
            Action::StatisticsLoaded(_) => "STATISTICS_LOADED",
            Action::StatisticsRecorded { .. } => "STATISTICS_RECORDED",
            Action::GroupsLoaded(_) => "GROUPS_LOADED",
            Action::GroupExcluded { .. } => "GROUP_EXCLUDED",
            Action::GroupFlagged { .. } => "GROUP_FLAGGED",
            Action::GroupExpanded { .. } => "GROUP_EXPANDED",
            Action::GroupMasterSet { .. } => "GROUP_MASTER_SET",
            Action::GroupMerged(_) => "GROUP_MERGED",
            Action::GroupsCleared => "GROUPS_CLEARED",
            Action::MergeLogsLoaded(_) => "MERGE_LOGS_LOADED",
            Action::PageRequested { .. } => "PAGE_REQUESTED",
            Action::DraftSaved(_) => "DRAFT_SAVED",
            Action::DraftCleared => "DRAFT_CLEARED",
            Action::ErrorRaised(_) => "ERROR_RAISED",
            Action::ErrorDismissed(_) => "ERROR_DISMISSED",
            Action::ErrorsCleared => "ERRORS_CLEARED",
            Action::NoticePosted(_) => "NOTICE_POSTED",
            Action::SectionPending(_) => "SECTION_PENDING",
            Action::SectionInvalidated(_) => "SECTION_INVALIDATED",
            Action::Reset => "RESET",
        }
    }
}

/// Bounds applied while reducing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub error_capacity: usize,
    pub notice_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            error_capacity: 10,
            notice_capacity: 10,
        }
    }
}

fn push_bounded<T>(list: &mut VecDeque<T>, item: T, capacity: usize) {
    list.push_back(item);
    while list.len() > capacity.max(1) {
        list.pop_front();
    }
}

fn with_group<F>(state: &mut StoreState, group_id: &str, f: F) -> bool
where
    F: FnOnce(&mut DuplicateGroup) -> bool,
{
    match state.groups.get_mut(group_id) {
        Some(group) => f(group),
        None => {
            debug!(group_id = %group_id, "Ignoring action for unknown group");
            false
        }
    }
}

/// Apply `action` to `state`. Returns `true` if the state changed.
///
/// Cache-bookkeeping actions (`SectionPending`, `SectionInvalidated`) leave
/// the data untouched and return `false`; the store handles them.
pub fn reduce(state: &mut StoreState, action: &Action, limits: Limits) -> bool {
    match action {
        Action::ConfigurationsLoaded(configs) => {
            state.configurations = configs.clone();
            if let Some(ref selected) = state.selected_configuration
                && !configs.iter().any(|c| &c.id == selected)
            {
                state.selected_configuration = None;
            }
            true
        }
        Action::ConfigurationSelected(id) => {
            if state.selected_configuration == *id {
                return false;
            }
            state.selected_configuration = id.clone();
            true
        }
        Action::JobsLoaded { active, scheduled } => {
            state.active_jobs = active.clone();
            state.scheduled_jobs = scheduled.clone();
            true
        }
        Action::JobUpserted(job) => {
            match state.active_jobs.iter_mut().find(|j| j.id == job.id) {
                Some(existing) if existing == job => return false,
                Some(existing) => *existing = job.clone(),
                None => state.active_jobs.push(job.clone()),
            }
            true
        }
        Action::ScheduleAdded(schedule) => {
            state.scheduled_jobs.retain(|s| s.id != schedule.id);
            state.scheduled_jobs.push(schedule.clone());
            true
        }
        Action::ScheduleRemoved(id) => {
            let before = state.scheduled_jobs.len();
            state.scheduled_jobs.retain(|s| &s.id != id);
            state.scheduled_jobs.len() != before
        }
        Action::StatisticsLoaded(stats) => {
            state.statistics = stats.clone();
            true
        }
        Action::StatisticsRecorded {
            object_type,
            date,
            duplicates_found,
            records_merged,
        } => {
            state
                .statistics
                .record(object_type, *date, *duplicates_found, *records_merged);
            true
        }
        Action::GroupsLoaded(groups) => {
            state.groups = groups.iter().map(|g| (g.id.clone(), g.clone())).collect();
            true
        }
        Action::GroupExcluded { group_id, excluded } => with_group(state, group_id, |g| {
            let changed = g.excluded != *excluded;
            g.excluded = *excluded;
            changed
        }),
        Action::GroupFlagged { group_id, flagged } => with_group(state, group_id, |g| {
            let changed = g.flagged != *flagged;
            g.flagged = *flagged;
            changed
        }),
        Action::GroupExpanded { group_id, expanded } => with_group(state, group_id, |g| {
            let changed = g.expanded != *expanded;
            g.expanded = *expanded;
            changed
        }),
        Action::GroupMasterSet {
            group_id,
            record_id,
        } => with_group(state, group_id, |g| {
            if !g.is_member(record_id) {
                debug!(group_id = %g.id, record_id = %record_id, "Ignoring non-member master");
                return false;
            }
            let changed = g.master_record_id.as_ref() != Some(record_id);
            g.master_record_id = Some(record_id.clone());
            changed
        }),
        Action::GroupMerged(group_id) => state.groups.remove(group_id).is_some(),
        Action::GroupsCleared => {
            let had_groups = !state.groups.is_empty();
            state.groups.clear();
            had_groups
        }
        Action::MergeLogsLoaded(page) => {
            state.merge_logs = page.records.clone();
            state.pagination = page.pagination.clone();
            true
        }
        Action::PageRequested {
            page_number,
            page_size,
        } => {
            state.pagination.page_number = (*page_number).max(1);
            state.pagination.page_size = (*page_size).max(1);
            true
        }
        Action::DraftSaved(draft) => {
            if state.draft_job.as_ref() == Some(draft) {
                return false;
            }
            state.draft_job = Some(draft.clone());
            true
        }
        Action::DraftCleared => state.draft_job.take().is_some(),
        Action::ErrorRaised(record) => {
            push_bounded(&mut state.errors, record.clone(), limits.error_capacity);
            true
        }
        Action::ErrorDismissed(id) => {
            let before = state.errors.len();
            state.errors.retain(|e| &e.id != id);
            state.errors.len() != before
        }
        Action::ErrorsCleared => {
            let had_errors = !state.errors.is_empty();
            state.errors.clear();
            had_errors
        }
        Action::NoticePosted(notice) => {
            push_bounded(&mut state.notices, notice.clone(), limits.notice_capacity);
            true
        }
        Action::SectionPending(_) | Action::SectionInvalidated(_) => false,
        Action::Reset => {
            *state = StoreState::default();
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, ErrorRecord};
    use crate::types::{JobStatus, MergeJob};

    fn job(id: &str, status: JobStatus) -> MergeJob {
        MergeJob {
            id: id.to_string(),
            config_id: "cfg".to_string(),
            object_type: Some("Account".to_string()),
            is_dry_run: true,
            batch_size: 200,
            status,
            records_processed: 0,
            duplicates_found: 0,
            error_messages: vec![],
            submitted_at: None,
            completion_time: None,
        }
    }

    #[test]
    fn test_every_action_names_one_section_except_reset() {
        assert_eq!(
            Action::JobUpserted(job("j", JobStatus::Queued)).section(),
            Some(Section::Jobs)
        );
        assert_eq!(Action::DraftCleared.section(), Some(Section::Draft));
        assert_eq!(
            Action::SectionInvalidated(Section::Statistics).section(),
            Some(Section::Statistics)
        );
        assert_eq!(Action::Reset.section(), None);
    }

    #[test]
    fn test_job_upsert_replaces_by_id() {
        let mut state = StoreState::default();
        let limits = Limits::default();
        assert!(reduce(&mut state, &Action::JobUpserted(job("j1", JobStatus::Queued)), limits));
        assert!(reduce(&mut state, &Action::JobUpserted(job("j1", JobStatus::Running)), limits));
        assert_eq!(state.active_jobs.len(), 1);
        assert_eq!(state.active_jobs[0].status, JobStatus::Running);

        // Identical upsert is not a transition.
        assert!(!reduce(&mut state, &Action::JobUpserted(job("j1", JobStatus::Running)), limits));
    }

    #[test]
    fn test_error_list_keeps_last_ten() {
        let mut state = StoreState::default();
        for i in 0..15 {
            let record = ErrorRecord::from_error(&EngineError::remote(format!("e{}", i)), i);
            reduce(&mut state, &Action::ErrorRaised(record), Limits::default());
        }
        assert_eq!(state.errors.len(), 10);
        assert_eq!(state.errors.front().unwrap().message, "e5");
        assert_eq!(state.errors.back().unwrap().message, "e14");
    }

    #[test]
    fn test_dismiss_error_by_id() {
        let mut state = StoreState::default();
        let record = ErrorRecord::from_error(&EngineError::remote("boom"), 1);
        let id = record.id.clone();
        reduce(&mut state, &Action::ErrorRaised(record), Limits::default());
        assert!(reduce(&mut state, &Action::ErrorDismissed(id.clone()), Limits::default()));
        assert!(!reduce(&mut state, &Action::ErrorDismissed(id), Limits::default()));
        assert!(state.errors.is_empty());
    }

    #[test]
    fn test_group_actions() {
        let mut state = StoreState::default();
        let limits = Limits::default();
        let group = DuplicateGroup::new("g1", "Account", ["a", "b", "c"], 88);
        reduce(&mut state, &Action::GroupsLoaded(vec![group]), limits);

        assert!(reduce(
            &mut state,
            &Action::GroupMasterSet {
                group_id: "g1".into(),
                record_id: "b".into()
            },
            limits
        ));
        // Non-member master is ignored.
        assert!(!reduce(
            &mut state,
            &Action::GroupMasterSet {
                group_id: "g1".into(),
                record_id: "z".into()
            },
            limits
        ));
        assert_eq!(state.groups["g1"].master_record_id.as_deref(), Some("b"));

        assert!(reduce(
            &mut state,
            &Action::GroupExcluded {
                group_id: "g1".into(),
                excluded: true
            },
            limits
        ));
        assert!(state.mergeable_groups().is_empty());

        assert!(reduce(&mut state, &Action::GroupMerged("g1".into()), limits));
        assert!(state.groups.is_empty());
        assert!(!reduce(&mut state, &Action::GroupMerged("g1".into()), limits));
    }

    #[test]
    fn test_configurations_reload_drops_stale_selection() {
        let mut state = StoreState {
            selected_configuration: Some("gone".into()),
            ..Default::default()
        };
        reduce(&mut state, &Action::ConfigurationsLoaded(vec![]), Limits::default());
        assert!(state.selected_configuration.is_none());
    }

    #[test]
    fn test_shared_actions() {
        assert!(Action::DraftCleared.is_shared());
        assert!(Action::GroupMerged("g".into()).is_shared());
        assert!(Action::SectionInvalidated(Section::Jobs).is_shared());
        assert!(!Action::SectionPending(Section::Jobs).is_shared());
        assert!(!Action::ErrorsCleared.is_shared());
        assert!(!Action::Reset.is_shared());
    }

    #[test]
    fn test_action_serializes_as_tagged_union() {
        let json = serde_json::to_value(Action::GroupMerged("g1".into())).unwrap();
        assert_eq!(json["type"], "GROUP_MERGED");
        assert_eq!(json["payload"], "g1");

        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back, Action::GroupMerged("g1".into()));
    }
}
