//! Draft persistence.
//!
//! The draft slot survives reloads through a [`DraftStorage`]. Persistence is
//! best-effort: [`BestEffortDrafts`] logs storage failures and carries on, so
//! a broken disk never blocks editing a draft.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::db::Database;
use crate::db::drafts::DEFAULT_SLOT;
use crate::types::DraftJob;

pub trait DraftStorage: Send + Sync {
    fn save(&self, draft: &DraftJob) -> Result<()>;
    fn load(&self) -> Result<Option<DraftJob>>;
    fn clear(&self) -> Result<()>;
}

/// Draft slot in the SQLite database.
#[derive(Clone)]
pub struct SqliteDrafts {
    db: Database,
    slot: String,
}

impl SqliteDrafts {
    pub fn new(db: Database) -> Self {
        Self::with_slot(db, DEFAULT_SLOT)
    }

    pub fn with_slot(db: Database, slot: impl Into<String>) -> Self {
        Self {
            db,
            slot: slot.into(),
        }
    }
}

impl DraftStorage for SqliteDrafts {
    fn save(&self, draft: &DraftJob) -> Result<()> {
        self.db.save_draft(&self.slot, draft)
    }

    fn load(&self) -> Result<Option<DraftJob>> {
        self.db.load_draft(&self.slot)
    }

    fn clear(&self) -> Result<()> {
        self.db.clear_draft(&self.slot).map(|_| ())
    }
}

/// Process-local slot.
#[derive(Default)]
pub struct MemoryDrafts {
    slot: Mutex<Option<DraftJob>>,
}

impl MemoryDrafts {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DraftStorage for MemoryDrafts {
    fn save(&self, draft: &DraftJob) -> Result<()> {
        *self.slot.lock().map_err(|_| anyhow::anyhow!("draft slot poisoned"))? = Some(draft.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<DraftJob>> {
        Ok(self
            .slot
            .lock()
            .map_err(|_| anyhow::anyhow!("draft slot poisoned"))?
            .clone())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock().map_err(|_| anyhow::anyhow!("draft slot poisoned"))? = None;
        Ok(())
    }
}

/// Wraps a storage and swallows its failures.
#[derive(Clone)]
pub struct BestEffortDrafts {
    inner: Arc<dyn DraftStorage>,
}

impl BestEffortDrafts {
    pub fn new(inner: Arc<dyn DraftStorage>) -> Self {
        Self { inner }
    }

    /// Returns `false` if the draft could not be persisted.
    pub fn save(&self, draft: &DraftJob) -> bool {
        match self.inner.save(draft) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to persist draft for {}: {}", draft.config_id, e);
                false
            }
        }
    }

    /// A missing or unreadable draft both load as `None`.
    pub fn load(&self) -> Option<DraftJob> {
        self.inner.load().unwrap_or_else(|e| {
            warn!("Failed to load persisted draft: {}", e);
            None
        })
    }

    pub fn clear(&self) -> bool {
        match self.inner.clear() {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to clear persisted draft: {}", e);
                false
            }
        }
    }
}
