//! Session-local message bus for cross-instance synchronization.
//!
//! Several store instances (one per open surface) can share a [`SyncBus`].
//! Every message carries the origin instance id; a store drops messages that
//! it sent itself and applies the rest without re-broadcasting them.
//! Delivery is at-most-once per receiver with no persistence or replay: a
//! receiver that falls behind the channel capacity loses the oldest messages.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Store;
use super::state::Action;
use crate::types::{GroupId, RecordId};

/// Phase of one logical merge operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePhase {
    Starting,
    Completed,
    Error,
}

/// Progress notification for a single merge, keyed by correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOperationEvent {
    pub correlation_id: String,
    pub phase: MergePhase,
    pub group_id: Option<GroupId>,
    pub master_id: RecordId,
    pub duplicate_ids: Vec<RecordId>,
    #[serde(default)]
    pub merged_id: Option<RecordId>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Bus payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusEvent {
    /// A state transition performed by another instance.
    StateSync(Action),
    MergeOperation(MergeOperationEvent),
}

impl BusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BusEvent::StateSync(_) => "STATE_SYNC",
            BusEvent::MergeOperation(_) => "MERGE_OPERATION",
        }
    }
}

/// Envelope carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(flatten)]
    pub event: BusEvent,
    /// Epoch milliseconds at send time.
    pub timestamp: i64,
    /// Instance id of the sender.
    pub source: String,
}

#[derive(Clone)]
pub struct SyncBus {
    tx: broadcast::Sender<BusMessage>,
}

impl SyncBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send to every current receiver. Sending with no receivers is not an error.
    pub fn publish(&self, message: BusMessage) {
        if let Ok(count) = self.tx.send(message) {
            debug!("Bus message delivered to {} receivers", count);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Settled correlation ids remembered by a [`MergeOperationTracker`].
const SETTLED_CAPACITY: usize = 256;

/// Lets several observers of the same bus act once per merge phase.
///
/// Phases of running operations are tracked individually. Once an operation
/// reaches a terminal phase its entries collapse into a bounded list of
/// settled ids, oldest evicted first.
#[derive(Debug, Default)]
pub struct MergeOperationTracker {
    running: HashSet<(String, MergePhase)>,
    settled: VecDeque<String>,
}

impl MergeOperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a (correlation id, phase) pair is observed.
    /// Every phase of a settled operation counts as already observed.
    pub fn observe(&mut self, event: &MergeOperationEvent) -> bool {
        let id = &event.correlation_id;
        if self.is_settled(id) {
            return false;
        }
        match event.phase {
            MergePhase::Starting => self.running.insert((id.clone(), event.phase)),
            MergePhase::Completed | MergePhase::Error => {
                self.running.retain(|(running, _)| running != id);
                self.settled.push_back(id.clone());
                if self.settled.len() > SETTLED_CAPACITY {
                    self.settled.pop_front();
                }
                true
            }
        }
    }

    /// Whether the operation reached a terminal phase.
    pub fn is_settled(&self, correlation_id: &str) -> bool {
        self.settled.iter().any(|id| id == correlation_id)
    }

    /// Operations seen starting that have not settled yet.
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Forget an operation entirely.
    pub fn forget(&mut self, correlation_id: &str) {
        self.running.retain(|(id, _)| id != correlation_id);
        self.settled.retain(|id| id != correlation_id);
    }
}

/// Apply bus traffic from other instances to `store` until the bus closes.
pub fn spawn_sync_listener(store: Arc<Store>, bus: &SyncBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => store.receive(&message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Sync listener lagged, {} messages dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Drive the store's throttled broadcast from wall-clock ticks.
pub fn spawn_flush_loop(store: Arc<Store>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            store.flush_due();
        }
    })
}
