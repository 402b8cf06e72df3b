//! Listener registry for store change notifications.
//!
//! Listeners register an [`Interest`] in a set of sections. When the throttle
//! flushes, the store asks the registry which listeners care about the
//! sections that changed in the window, so a change to `jobs` never wakes a
//! listener that only renders `statistics`.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::Notification;
use super::cache::Section;

pub type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Which sections a listener wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interest {
    All,
    Sections(BTreeSet<Section>),
}

impl Interest {
    pub fn sections(sections: impl IntoIterator<Item = Section>) -> Self {
        Interest::Sections(sections.into_iter().collect())
    }

    pub fn matches(&self, changed: &BTreeSet<Section>) -> bool {
        match self {
            Interest::All => !changed.is_empty(),
            Interest::Sections(wanted) => !wanted.is_disjoint(changed),
        }
    }
}

struct Entry {
    id: u64,
    interest: Interest,
    listener: Listener,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    entries: Vec<Entry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns its id.
    pub fn subscribe(&mut self, interest: Interest, listener: Listener) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(Entry {
            id,
            interest,
            listener,
        });
        id
    }

    /// Remove a listener. Returns `true` if it was registered.
    pub fn unsubscribe(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Listeners interested in any of the changed sections, in registration order.
    pub fn affected(&self, changed: &BTreeSet<Section>) -> Vec<Listener> {
        self.entries
            .iter()
            .filter(|e| e.interest.matches(changed))
            .map(|e| Arc::clone(&e.listener))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Listener {
        Arc::new(|_: &Notification| {})
    }

    fn changed(sections: &[Section]) -> BTreeSet<Section> {
        sections.iter().copied().collect()
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let mut reg = SubscriptionRegistry::new();
        assert!(reg.is_empty());

        let id = reg.subscribe(Interest::All, noop());
        assert_eq!(reg.len(), 1);

        assert!(reg.unsubscribe(id));
        assert!(reg.is_empty());
        assert!(!reg.unsubscribe(id));
    }

    #[test]
    fn test_affected_filters_by_section() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(Interest::sections([Section::Jobs]), noop());
        reg.subscribe(Interest::sections([Section::Statistics]), noop());
        reg.subscribe(Interest::All, noop());

        assert_eq!(reg.affected(&changed(&[Section::Jobs])).len(), 2);
        assert_eq!(
            reg.affected(&changed(&[Section::Jobs, Section::Statistics])).len(),
            3
        );
        assert_eq!(reg.affected(&changed(&[Section::Draft])).len(), 1);
    }

    #[test]
    fn test_nothing_changed_wakes_nobody() {
        let mut reg = SubscriptionRegistry::new();
        reg.subscribe(Interest::All, noop());
        assert!(reg.affected(&BTreeSet::new()).is_empty());
    }
}
