//! Trailing-edge broadcast throttle.
//!
//! The first change after a flush opens a window; further changes inside the
//! window only accumulate their sections. When the window closes the owner
//! flushes once with the latest state. The deadline never moves once set, so a
//! steady stream of dispatches still broadcasts at least once per window.

use std::collections::BTreeSet;
use std::time::Duration;

use super::cache::Section;

#[derive(Debug, Clone)]
pub struct Throttle {
    window_ms: i64,
    deadline: Option<i64>,
    dirty: BTreeSet<Section>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
            deadline: None,
            dirty: BTreeSet::new(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(0) as u64)
    }

    /// Record a change; opens the window if none is pending.
    pub fn mark(&mut self, sections: impl IntoIterator<Item = Section>, now_ms: i64) {
        self.dirty.extend(sections);
        if self.deadline.is_none() {
            self.deadline = Some(now_ms + self.window_ms);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        matches!(self.deadline, Some(deadline) if now_ms >= deadline)
    }

    /// Take the accumulated sections if the window has closed.
    pub fn take_due(&mut self, now_ms: i64) -> Option<BTreeSet<Section>> {
        if self.is_due(now_ms) { self.take() } else { None }
    }

    /// Take the accumulated sections regardless of the deadline.
    pub fn take(&mut self) -> Option<BTreeSet<Section>> {
        self.deadline.take()?;
        Some(std::mem::take(&mut self.dirty))
    }

    pub fn clear(&mut self) {
        self.deadline = None;
        self.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rapid_marks_collapse_into_one_flush() {
        let mut throttle = Throttle::new(Duration::from_millis(500));
        throttle.mark([Section::Jobs], 0);
        throttle.mark([Section::Statistics], 100);
        throttle.mark([Section::Jobs], 499);

        assert!(throttle.take_due(499).is_none());
        let flushed = throttle.take_due(500).unwrap();
        assert_eq!(
            flushed.into_iter().collect::<Vec<_>>(),
            vec![Section::Jobs, Section::Statistics]
        );
        assert!(!throttle.is_pending());
        assert!(throttle.take_due(10_000).is_none());
    }

    #[test]
    fn test_deadline_does_not_slide() {
        let mut throttle = Throttle::new(Duration::from_millis(500));
        throttle.mark([Section::Groups], 1_000);
        throttle.mark([Section::Groups], 1_400);
        assert_eq!(throttle.deadline(), Some(1_500));
    }

    #[test]
    fn test_forced_take_ignores_deadline() {
        let mut throttle = Throttle::new(Duration::from_millis(500));
        assert!(throttle.take().is_none());
        throttle.mark([Section::Draft], 0);
        assert_eq!(throttle.take().unwrap().len(), 1);
    }
}
