//! Field-level merge preview.
//!
//! [`compute_resolutions`] is a pure function of its inputs: it never reads
//! the clock, the store or the network, and does not mutate the group.
//!
//! For each field the master's non-blank value is the base. If the master has
//! none, the first non-blank value among the other members in ascending id
//! order fills it. Every distinct non-blank non-master value that differs
//! from the base is a conflict candidate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use crate::types::{
    DuplicateGroup, FieldResolution, MatchConfiguration, RecordId, RecordSnapshot,
    ResolutionStatus, display_value, is_blank,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePreview {
    pub group_id: String,
    pub master_id: RecordId,
    pub resolutions: Vec<FieldResolution>,
    pub has_conflicts: bool,
    pub conflict_summary: String,
}

impl MergePreview {
    pub fn resolution(&self, field: &str) -> Option<&FieldResolution> {
        self.resolutions.iter().find(|r| r.field_name == field)
    }

    /// Conflicts without an explicit operator choice.
    pub fn unresolved_conflicts(&self) -> usize {
        self.resolutions
            .iter()
            .filter(|r| r.is_unresolved_conflict())
            .count()
    }

    /// Apply an operator override for one field.
    ///
    /// A conflicting field accepts its current value or one of its candidates;
    /// any other field accepts any value. A blank value is rejected.
    pub fn choose_value(&mut self, field: &str, value: Value) -> EngineResult<()> {
        if is_blank(&value) {
            return Err(EngineError::validation(format!(
                "Chosen value for {} is empty",
                field
            ))
            .with_fields([field]));
        }
        let resolution = self
            .resolutions
            .iter_mut()
            .find(|r| r.field_name == field)
            .ok_or_else(|| {
                EngineError::validation(format!("Field {} is not part of this preview", field))
                    .with_fields([field])
            })?;

        if resolution.status == ResolutionStatus::Conflict {
            let allowed = resolution.chosen_value.as_ref() == Some(&value)
                || resolution.master_value.as_ref() == Some(&value)
                || resolution.candidate_values.contains(&value);
            if !allowed {
                return Err(EngineError::validation(format!(
                    "Value {} is not a candidate for {}",
                    display_value(&value),
                    field
                ))
                .with_fields([field]));
            }
        }
        resolution.chosen_value = Some(value);
        resolution.explicitly_chosen = true;
        self.conflict_summary = summarize(&self.resolutions);
        Ok(())
    }

    /// Chosen values keyed by field, skipping fields with no value.
    pub fn chosen_values(&self) -> BTreeMap<String, Value> {
        self.resolutions
            .iter()
            .filter_map(|r| Some((r.field_name.clone(), r.chosen_value.clone()?)))
            .collect()
    }
}

/// Resolve `fields` across `group` with `master_id` as the surviving record.
///
/// `labels` maps field names to display labels; unmapped fields use their name.
pub fn compute_resolutions(
    group: &DuplicateGroup,
    master_id: &str,
    fields: &[String],
    labels: &BTreeMap<String, String>,
    snapshots: &BTreeMap<RecordId, RecordSnapshot>,
) -> EngineResult<MergePreview> {
    if !group.is_member(master_id) {
        return Err(EngineError::validation(format!(
            "Master {} is not a member of group {}",
            master_id, group.id
        ))
        .with_fields(["masterRecordId"]));
    }

    let master = snapshots.get(master_id);
    let others: Vec<&RecordSnapshot> = group
        .member_record_ids
        .iter()
        .filter(|id| id.as_str() != master_id)
        .filter_map(|id| snapshots.get(id))
        .collect();

    let resolutions: Vec<FieldResolution> = fields
        .iter()
        .map(|field| {
            let label = labels.get(field).cloned().unwrap_or_else(|| field.clone());
            resolve_field(field, label, master, &others)
        })
        .collect();

    let has_conflicts = resolutions
        .iter()
        .any(|r| r.status == ResolutionStatus::Conflict);
    let conflict_summary = summarize(&resolutions);

    Ok(MergePreview {
        group_id: group.id.clone(),
        master_id: master_id.to_string(),
        resolutions,
        has_conflicts,
        conflict_summary,
    })
}

/// Preview using the configuration's match fields and labels.
pub fn preview_for_configuration(
    config: &MatchConfiguration,
    group: &DuplicateGroup,
    master_id: &str,
    snapshots: &BTreeMap<RecordId, RecordSnapshot>,
) -> EngineResult<MergePreview> {
    let mut fields = config.match_fields.clone();
    for required in &config.required_fields {
        if !fields.contains(required) {
            fields.push(required.clone());
        }
    }
    compute_resolutions(group, master_id, &fields, &config.field_labels, snapshots)
}

fn resolve_field(
    field: &str,
    label: String,
    master: Option<&RecordSnapshot>,
    others: &[&RecordSnapshot],
) -> FieldResolution {
    let master_value = master.and_then(|m| m.value(field)).cloned();

    let (base, filled) = match master_value {
        Some(ref v) => (Some(v.clone()), false),
        None => {
            let fill = others.iter().find_map(|s| s.value(field)).cloned();
            let filled = fill.is_some();
            (fill, filled)
        }
    };

    let mut candidates: Vec<Value> = Vec::new();
    for snapshot in others {
        if let Some(v) = snapshot.value(field)
            && base.as_ref() != Some(v)
            && !candidates.contains(v)
        {
            candidates.push(v.clone());
        }
    }

    let status = if !candidates.is_empty() {
        ResolutionStatus::Conflict
    } else if filled {
        ResolutionStatus::Filled
    } else {
        ResolutionStatus::Unchanged
    };

    FieldResolution {
        field_name: field.to_string(),
        label,
        master_value,
        candidate_values: candidates,
        status,
        chosen_value: base,
        explicitly_chosen: false,
    }
}

fn summarize(resolutions: &[FieldResolution]) -> String {
    let conflicts: Vec<String> = resolutions
        .iter()
        .filter(|r| r.status == ResolutionStatus::Conflict)
        .map(|r| {
            let kept = r
                .chosen_value
                .as_ref()
                .map(display_value)
                .unwrap_or_default();
            let others: Vec<String> = r.candidate_values.iter().map(display_value).collect();
            let marker = if r.explicitly_chosen { " (chosen)" } else { "" };
            format!(
                "{}: keeping \"{}\"{} over {}",
                r.label,
                kept,
                marker,
                others
                    .iter()
                    .map(|o| format!("\"{}\"", o))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
        .collect();

    match conflicts.len() {
        0 => "No conflicts".to_string(),
        1 => format!("1 conflict. {}", conflicts[0]),
        n => format!("{} conflicts. {}", n, conflicts.join("; ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn snap(id: &str) -> RecordSnapshot {
        RecordSnapshot::new(id, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn index(list: Vec<RecordSnapshot>) -> BTreeMap<RecordId, RecordSnapshot> {
        list.into_iter().map(|s| (s.id.clone(), s)).collect()
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_phone_conflict() {
        let group = DuplicateGroup::new("g1", "Contact", ["m", "d1", "d2"], 95);
        let snaps = index(vec![
            snap("m").with_field("Phone", "555-0100"),
            snap("d1").with_field("Phone", "555-0199"),
            snap("d2").with_field("Phone", Value::Null),
        ]);
        let preview =
            compute_resolutions(&group, "m", &fields(&["Phone"]), &BTreeMap::new(), &snaps)
                .unwrap();
        let phone = preview.resolution("Phone").unwrap();
        assert_eq!(phone.status, ResolutionStatus::Conflict);
        assert_eq!(phone.chosen_value, Some(json!("555-0100")));
        assert_eq!(phone.candidate_values, vec![json!("555-0199")]);
        assert!(preview.has_conflicts);
        assert!(preview.conflict_summary.contains("555-0199"));
    }

    #[test]
    fn test_fill_from_lowest_id_member() {
        let group = DuplicateGroup::new("g1", "Account", ["m", "b", "a"], 80);
        let snaps = index(vec![
            snap("m").with_field("Email", "   "),
            snap("b").with_field("Email", "b@example.com"),
            snap("a").with_field("Email", "a@example.com"),
        ]);
        let preview =
            compute_resolutions(&group, "m", &fields(&["Email"]), &BTreeMap::new(), &snaps)
                .unwrap();
        let email = preview.resolution("Email").unwrap();
        assert_eq!(email.master_value, None);
        assert_eq!(email.chosen_value, Some(json!("a@example.com")));
        // b differs from the filled base.
        assert_eq!(email.status, ResolutionStatus::Conflict);
        assert_eq!(email.candidate_values, vec![json!("b@example.com")]);
    }

    #[test]
    fn test_filled_and_unchanged() {
        let group = DuplicateGroup::new("g1", "Account", ["m", "d"], 80);
        let snaps = index(vec![
            snap("m").with_field("Name", "Acme"),
            snap("d").with_field("Name", "Acme").with_field("City", "Oslo"),
        ]);
        let preview = compute_resolutions(
            &group,
            "m",
            &fields(&["Name", "City", "Fax"]),
            &BTreeMap::from([("City".to_string(), "Billing City".to_string())]),
            &snaps,
        )
        .unwrap();

        let name = preview.resolution("Name").unwrap();
        assert_eq!(name.status, ResolutionStatus::Unchanged);

        let city = preview.resolution("City").unwrap();
        assert_eq!(city.status, ResolutionStatus::Filled);
        assert_eq!(city.label, "Billing City");
        assert_eq!(city.chosen_value, Some(json!("Oslo")));

        let fax = preview.resolution("Fax").unwrap();
        assert_eq!(fax.status, ResolutionStatus::Unchanged);
        assert_eq!(fax.chosen_value, None);

        assert!(!preview.has_conflicts);
        assert_eq!(preview.conflict_summary, "No conflicts");
    }

    #[test]
    fn test_candidates_are_deduplicated() {
        let group = DuplicateGroup::new("g1", "Account", ["m", "a", "b", "c"], 80);
        let snaps = index(vec![
            snap("m").with_field("Phone", "1"),
            snap("a").with_field("Phone", "2"),
            snap("b").with_field("Phone", "2"),
            snap("c").with_field("Phone", "3"),
        ]);
        let preview =
            compute_resolutions(&group, "m", &fields(&["Phone"]), &BTreeMap::new(), &snaps)
                .unwrap();
        assert_eq!(
            preview.resolution("Phone").unwrap().candidate_values,
            vec![json!("2"), json!("3")]
        );
    }

    #[test]
    fn test_pure_and_deterministic() {
        let group = DuplicateGroup::new("g1", "Account", ["m", "d"], 80);
        let snaps = index(vec![
            snap("m").with_field("Phone", "1"),
            snap("d").with_field("Phone", "2"),
        ]);
        let before_group = group.clone();
        let before_snaps = snaps.clone();
        let f = fields(&["Phone"]);
        let first = compute_resolutions(&group, "m", &f, &BTreeMap::new(), &snaps).unwrap();
        let second = compute_resolutions(&group, "m", &f, &BTreeMap::new(), &snaps).unwrap();
        assert_eq!(first, second);
        assert_eq!(group, before_group);
        assert_eq!(snaps, before_snaps);
    }

    #[test]
    fn test_non_member_master_rejected() {
        let group = DuplicateGroup::new("g1", "Account", ["a"], 80);
        let err = compute_resolutions(&group, "z", &[], &BTreeMap::new(), &BTreeMap::new())
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_choose_value() {
        let group = DuplicateGroup::new("g1", "Contact", ["m", "d"], 95);
        let snaps = index(vec![
            snap("m").with_field("Phone", "1"),
            snap("d").with_field("Phone", "2"),
        ]);
        let mut preview =
            compute_resolutions(&group, "m", &fields(&["Phone"]), &BTreeMap::new(), &snaps)
                .unwrap();
        assert_eq!(preview.unresolved_conflicts(), 1);

        assert!(preview.choose_value("Phone", json!("9")).is_err());
        assert!(preview.choose_value("Phone", json!("  ")).is_err());
        assert!(preview.choose_value("Nope", json!("1")).is_err());

        preview.choose_value("Phone", json!("2")).unwrap();
        let phone = preview.resolution("Phone").unwrap();
        assert!(phone.explicitly_chosen);
        assert_eq!(phone.chosen_value, Some(json!("2")));
        assert_eq!(preview.unresolved_conflicts(), 0);
        assert!(preview.conflict_summary.contains("(chosen)"));
        assert_eq!(preview.chosen_values().get("Phone"), Some(&json!("2")));
    }

    #[test]
    fn test_preview_for_configuration_appends_required_fields() {
        let config = MatchConfiguration {
            id: "c".into(),
            label: "C".into(),
            developer_name: "C".into(),
            object_type: "Account".into(),
            match_fields: fields(&["Name"]),
            required_fields: fields(&["Name", "Industry"]),
            field_labels: BTreeMap::new(),
            master_strategy: Default::default(),
            batch_size: 200,
            active: true,
        };
        let group = DuplicateGroup::new("g1", "Account", ["m"], 80);
        let snaps = index(vec![snap("m").with_field("Name", "Acme")]);
        let preview = preview_for_configuration(&config, &group, "m", &snaps).unwrap();
        let names: Vec<&str> = preview
            .resolutions
            .iter()
            .map(|r| r.field_name.as_str())
            .collect();
        assert_eq!(names, vec!["Name", "Industry"]);
    }
}
