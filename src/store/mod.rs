//! Per-session state store.
//!
//! The [`Store`] is the single writer of a session's [`StoreState`]. Other
//! components hold `Arc<Store>` and read immutable `Arc<StoreState>`
//! snapshots. Changes go through [`Store::dispatch`]:
//!
//! 1. the action is reduced into a copy of the current state,
//! 2. the touched section's cache entry is refreshed,
//! 3. the section is marked in the broadcast throttle,
//! 4. shared actions are published on the sync bus, if one is attached.
//!
//! Listeners are not called from `dispatch`. They are called from
//! [`Store::flush_due`] (or [`Store::flush`]) once per throttle window with
//! the latest snapshot, so intermediate states are never broadcast.
//!
//! A reducer panic is treated as catastrophic: the store logs it and resets
//! to the default state instead of propagating.

pub mod cache;
pub mod state;
pub mod subscriptions;
pub mod sync;
pub mod throttle;

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

pub use cache::{CachePolicy, CacheSection, Section};
pub use state::{Action, Limits, Notice, StoreState, reduce};
pub use subscriptions::{Interest, Listener};
pub use sync::{BusEvent, BusMessage, MergeOperationEvent, MergePhase, MergeOperationTracker, SyncBus};

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::error::{EngineError, ErrorRecord};
use subscriptions::SubscriptionRegistry;
use throttle::Throttle;

/// Payload handed to listeners on each flush.
#[derive(Debug, Clone)]
pub struct Notification {
    pub state: Arc<StoreState>,
    /// Sections changed since the previous flush.
    pub sections: BTreeSet<Section>,
}

struct Inner {
    state: Arc<StoreState>,
    sections: BTreeMap<Section, CacheSection>,
    throttle: Throttle,
    registry: SubscriptionRegistry,
}

impl Inner {
    fn new(window: Duration) -> Self {
        Self {
            state: Arc::new(StoreState::default()),
            sections: fresh_sections(),
            throttle: Throttle::new(window),
            registry: SubscriptionRegistry::new(),
        }
    }

    fn section_mut(&mut self, section: Section) -> &mut CacheSection {
        self.sections
            .entry(section)
            .or_insert_with(|| CacheSection::new(section))
    }
}

fn fresh_sections() -> BTreeMap<Section, CacheSection> {
    Section::ALL
        .iter()
        .map(|s| (*s, CacheSection::new(*s)))
        .collect()
}

/// Handle returned by [`Store::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    inner: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving notifications. Returns `false` if the store is gone.
    pub fn unsubscribe(self) -> bool {
        self.remove()
    }

    fn remove(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => lock(&inner).registry.unsubscribe(self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Lock the store, recovering from poisoning by resetting data to defaults.
/// Listeners survive the reset.
fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| {
        error!("Store lock poisoned, resetting state");
        let mut guard = poisoned.into_inner();
        guard.state = Arc::new(StoreState::default());
        guard.sections = fresh_sections();
        guard.throttle.clear();
        inner.clear_poison();
        guard
    })
}

pub struct Store {
    instance_id: String,
    clock: Arc<dyn Clock>,
    policy: CachePolicy,
    limits: Limits,
    inner: Arc<Mutex<Inner>>,
    bus: Option<SyncBus>,
}

impl Store {
    pub fn new(config: &StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            clock,
            policy: config.cache_policy(),
            limits: Limits {
                error_capacity: config.error_capacity,
                notice_capacity: config.notice_capacity,
            },
            inner: Arc::new(Mutex::new(Inner::new(Duration::from_millis(
                config.throttle_window_ms,
            )))),
            bus: None,
        }
    }

    /// Attach a session bus for cross-instance synchronization.
    pub fn with_bus(mut self, bus: SyncBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn bus(&self) -> Option<&SyncBus> {
        self.bus.as_ref()
    }

    /// Current state snapshot.
    pub fn get_state(&self) -> Arc<StoreState> {
        Arc::clone(&lock(&self.inner).state)
    }

    /// Copy of a section's cache bookkeeping.
    pub fn get_section(&self, section: Section) -> CacheSection {
        lock(&self.inner).section_mut(section).clone()
    }

    /// Freshness check without recording a lookup.
    pub fn is_valid(&self, section: Section) -> bool {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);
        let entry = inner.section_mut(section);
        self.policy.is_valid(entry, now)
    }

    /// Freshness check that feeds the adaptive timeout. Loaders call this to
    /// decide whether to short-circuit a fetch.
    pub fn lookup(&self, section: Section) -> bool {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);
        let entry = inner.section_mut(section);
        let hit = self.policy.is_valid(entry, now);
        entry.record_lookup(hit);
        hit
    }

    pub fn effective_timeout(&self, section: Section) -> Duration {
        let mut inner = lock(&self.inner);
        let entry = inner.section_mut(section);
        self.policy.timeout(entry)
    }

    /// Apply a local action. Returns `true` if the data changed.
    pub fn dispatch(&self, action: Action) -> bool {
        let changed = self.apply(&action);
        if action.is_shared()
            && let Some(ref bus) = self.bus
        {
            bus.publish(BusMessage {
                event: BusEvent::StateSync(action),
                timestamp: self.clock.now_ms(),
                source: self.instance_id.clone(),
            });
        }
        changed
    }

    /// Apply a message from the bus. Own-origin messages are dropped and
    /// applied actions are not re-published.
    pub fn receive(&self, message: &BusMessage) {
        if message.source == self.instance_id {
            return;
        }
        match &message.event {
            BusEvent::StateSync(action) => {
                debug!(action = action.name(), source = %message.source, "Applying remote action");
                self.apply(action);
            }
            BusEvent::MergeOperation(_) => {}
        }
    }

    /// Publish a non-state event on the bus, tagged with this instance.
    pub fn publish(&self, event: BusEvent) {
        if let Some(ref bus) = self.bus {
            bus.publish(BusMessage {
                event,
                timestamp: self.clock.now_ms(),
                source: self.instance_id.clone(),
            });
        }
    }

    fn apply(&self, action: &Action) -> bool {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);

        let mut next = (*inner.state).clone();
        let limits = self.limits;
        let outcome = catch_unwind(AssertUnwindSafe(|| reduce(&mut next, action, limits)));
        let changed = match outcome {
            Ok(changed) => changed,
            Err(_) => {
                error!(action = action.name(), "Reducer panicked, resetting store state");
                inner.state = Arc::new(StoreState::default());
                inner.sections = fresh_sections();
                inner.throttle.mark(Section::ALL, now);
                return true;
            }
        };

        if changed {
            inner.state = Arc::new(next);
        }

        match action {
            Action::Reset => {
                inner.sections = fresh_sections();
                inner.throttle.mark(Section::ALL, now);
            }
            Action::SectionPending(section) => {
                inner.section_mut(*section).pending = true;
            }
            Action::SectionInvalidated(section) => {
                inner.section_mut(*section).invalidate();
                inner.throttle.mark([*section], now);
            }
            _ => {
                if let Some(section) = action.section() {
                    if action.refreshes_cache() {
                        inner.section_mut(section).touch(now);
                    }
                    if changed {
                        inner.throttle.mark([section], now);
                    }
                }
            }
        }
        changed
    }

    /// Register a listener for flushes touching `interest`.
    pub fn subscribe<F>(&self, interest: Interest, listener: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = lock(&self.inner)
            .registry
            .subscribe(interest, Arc::new(listener));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether a broadcast is waiting for its window to close.
    pub fn has_pending_broadcast(&self) -> bool {
        lock(&self.inner).throttle.is_pending()
    }

    /// Broadcast if the throttle window has closed. Returns `true` if a
    /// broadcast happened.
    pub fn flush_due(&self) -> bool {
        let now = self.clock.now_ms();
        let batch = {
            let mut inner = lock(&self.inner);
            inner
                .throttle
                .take_due(now)
                .map(|sections| (sections, Arc::clone(&inner.state)))
        };
        self.broadcast(batch)
    }

    /// Broadcast any pending change immediately.
    pub fn flush(&self) -> bool {
        let batch = {
            let mut inner = lock(&self.inner);
            inner
                .throttle
                .take()
                .map(|sections| (sections, Arc::clone(&inner.state)))
        };
        self.broadcast(batch)
    }

    fn broadcast(&self, batch: Option<(BTreeSet<Section>, Arc<StoreState>)>) -> bool {
        let Some((sections, state)) = batch else {
            return false;
        };
        let listeners = lock(&self.inner).registry.affected(&sections);
        let notification = Notification { state, sections };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&notification))).is_err() {
                warn!("Store listener panicked; continuing with remaining listeners");
            }
        }
        true
    }

    /// Normalize an error into the bounded error list and return the record.
    pub fn report_error(&self, err: &EngineError) -> ErrorRecord {
        let record = ErrorRecord::from_error(err, self.clock.now_ms());
        if err.code.is_fatal() {
            warn!(code = %err.code, "{}", record.message);
        } else {
            debug!(code = %err.code, "{}", record.message);
        }
        self.dispatch(Action::ErrorRaised(record.clone()));
        record
    }

    pub fn post_notice(&self, message: impl Into<String>) {
        self.dispatch(Action::NoticePosted(Notice {
            message: message.into(),
            timestamp: self.clock.now_ms(),
        }));
    }
}
