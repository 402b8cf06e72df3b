//! Draft slot storage.

use super::{Database, now_ms};
use crate::types::DraftJob;
use anyhow::Result;
use rusqlite::{OptionalExtension, params};

pub const DEFAULT_SLOT: &str = "draft";

impl Database {
    /// Store the draft in `slot`, replacing any previous one.
    pub fn save_draft(&self, slot: &str, draft: &DraftJob) -> Result<()> {
        let payload = serde_json::to_string(draft)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO drafts (slot, payload, saved_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(slot) DO UPDATE SET payload = excluded.payload, saved_at = excluded.saved_at",
                params![slot, payload, now_ms()],
            )?;
            Ok(())
        })
    }

    pub fn load_draft(&self, slot: &str) -> Result<Option<DraftJob>> {
        let payload: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT payload FROM drafts WHERE slot = ?1",
                    params![slot],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }

    /// Returns `true` if a draft was removed.
    pub fn clear_draft(&self, slot: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM drafts WHERE slot = ?1", params![slot])?;
            Ok(removed > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> DraftJob {
        DraftJob {
            config_id: "acct".into(),
            object_type: "Account".into(),
            batch_size: 200,
            match_fields: vec!["Name".into(), "Phone".into()],
            saved_at: None,
        }
    }

    #[test]
    fn test_save_load_clear() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.load_draft(DEFAULT_SLOT).unwrap(), None);

        db.save_draft(DEFAULT_SLOT, &draft()).unwrap();
        assert_eq!(db.load_draft(DEFAULT_SLOT).unwrap(), Some(draft()));

        let mut changed = draft();
        changed.batch_size = 50;
        db.save_draft(DEFAULT_SLOT, &changed).unwrap();
        assert_eq!(db.load_draft(DEFAULT_SLOT).unwrap().unwrap().batch_size, 50);

        assert!(db.clear_draft(DEFAULT_SLOT).unwrap());
        assert!(!db.clear_draft(DEFAULT_SLOT).unwrap());
        assert_eq!(db.load_draft(DEFAULT_SLOT).unwrap(), None);
    }

    #[test]
    fn test_slots_are_independent() {
        let db = Database::open_in_memory().unwrap();
        db.save_draft("a", &draft()).unwrap();
        assert_eq!(db.load_draft("b").unwrap(), None);
    }

    #[test]
    fn test_corrupt_payload_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO drafts (slot, payload, saved_at) VALUES ('x', '{broken', 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        assert!(db.load_draft("x").is_err());
    }
}
