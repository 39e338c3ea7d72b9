//! Cancellable deadlines driven by an explicit clock.
//!
//! Nothing here sleeps. The owner asks for [`Timers::next_deadline`], waits
//! however it likes (a `tokio::time::sleep_until`, or nothing at all in a
//! test), then calls [`Timers::expire`] with the current instant.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A set of named deadlines. Scheduling an existing key replaces it.
#[derive(Debug, Clone)]
pub struct Timers<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> Timers<K> {
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }

    /// Fire `key` once `after` has elapsed from `now`.
    pub fn schedule(&mut self, key: K, now: Instant, after: Duration) {
        self.deadlines.insert(key, now + after);
    }

    /// Returns whether the key was scheduled.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Keep only the timers matching `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.deadlines.retain(|key, _| keep(key));
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.deadlines.get(key).copied()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key due at `now`, earliest first.
    pub fn expire(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(Instant, K)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*deadline, key.clone()))
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);
        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for Timers<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn test_expire_in_deadline_order() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule("late", t0, 3 * SEC);
        timers.schedule("early", t0, SEC);
        timers.schedule("never", t0, 60 * SEC);

        assert!(timers.expire(t0).is_empty());
        assert_eq!(timers.next_deadline(), Some(t0 + SEC));
        assert_eq!(timers.expire(t0 + 5 * SEC), vec!["early", "late"]);
        assert_eq!(timers.len(), 1);
        assert!(timers.is_scheduled(&"never"));
    }

    #[test]
    fn test_reschedule_replaces() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(1u8, t0, SEC);
        timers.schedule(1u8, t0, 10 * SEC);

        assert!(timers.expire(t0 + 2 * SEC).is_empty());
        assert_eq!(timers.deadline(&1), Some(t0 + 10 * SEC));
    }

    #[test]
    fn test_cancel_and_retain() {
        let t0 = Instant::now();
        let mut timers = Timers::new();
        for key in 0..4u8 {
            timers.schedule(key, t0, SEC);
        }
        assert!(timers.cancel(&0));
        assert!(!timers.cancel(&0));

        timers.retain(|key| key % 2 == 1);
        assert_eq!(timers.len(), 2);

        timers.clear();
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
