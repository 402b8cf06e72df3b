//! Master record selection.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::{DuplicateGroup, MasterStrategy, RecordId, RecordSnapshot};

/// Pick the master of `group` under `strategy`.
///
/// Members without a snapshot rank below every member that has one. Ties are
/// broken by ascending record id, so the result is deterministic for a given
/// input.
pub fn select_master(
    group: &DuplicateGroup,
    strategy: MasterStrategy,
    snapshots: &BTreeMap<RecordId, RecordSnapshot>,
) -> EngineResult<RecordId> {
    // Members iterate in ascending id order; `min_by` keeps the first of equals.
    let chosen = group
        .member_record_ids
        .iter()
        .min_by(|a, b| rank(strategy, snapshots.get(*a), snapshots.get(*b)))
        .cloned()
        .ok_or_else(|| {
            EngineError::validation(format!("Duplicate group {} has no members", group.id))
        })?;
    debug!(group_id = %group.id, strategy = %strategy, master = %chosen, "Selected master");
    Ok(chosen)
}

/// `Less` means `a` is the better master.
fn rank(
    strategy: MasterStrategy,
    a: Option<&RecordSnapshot>,
    b: Option<&RecordSnapshot>,
) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match strategy {
            MasterStrategy::OldestCreated => a.created_at.cmp(&b.created_at),
            MasterStrategy::MostRecent => b.modified_at.cmp(&a.modified_at),
            MasterStrategy::MostComplete => b.populated_count().cmp(&a.populated_count()),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Operator override of the master.
pub fn set_master(group: &mut DuplicateGroup, record_id: &str) -> EngineResult<()> {
    if !group.is_member(record_id) {
        return Err(EngineError::validation(format!(
            "Record {} is not a member of group {}",
            record_id, group.id
        ))
        .with_fields(["masterRecordId"]));
    }
    group.master_record_id = Some(record_id.to_string());
    Ok(())
}

/// Keep an existing valid master, otherwise select one.
pub fn ensure_master(
    group: &mut DuplicateGroup,
    strategy: MasterStrategy,
    snapshots: &BTreeMap<RecordId, RecordSnapshot>,
) -> EngineResult<RecordId> {
    if let Some(ref master) = group.master_record_id
        && group.is_member(master)
    {
        return Ok(master.clone());
    }
    let master = select_master(group, strategy, snapshots)?;
    group.master_record_id = Some(master.clone());
    Ok(master)
}
