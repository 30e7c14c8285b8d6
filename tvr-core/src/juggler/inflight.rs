//! Outstanding outbound events keyed by correlation id.
//!
//! Removal from this table is the single arbitration point between a
//! matching response and timeout eviction: whoever removes the entry
//! settles it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::settle::Settlable;

// ── InFlightEvent ────────────────────────────────────────────────

/// An event that has been written and awaits its response.
#[derive(Debug)]
pub struct InFlightEvent {
    pub payload: String,
    /// When `send_event` accepted the event.
    pub enqueued_at: Instant,
    pub settlable: Settlable<String>,
}

impl InFlightEvent {
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.enqueued_at.elapsed() > timeout
    }
}

// ── InFlightTable ────────────────────────────────────────────────

#[derive(Debug)]
pub struct InFlightTable {
    entries: Mutex<HashMap<String, InFlightEvent>>,
    timeout: Duration,
}

impl InFlightTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Insert under an id drawn from `generate`, drawing again while the
    /// id is taken. Check and insert happen under one lock.
    pub fn insert_with<G>(&self, mut generate: G, event: InFlightEvent) -> String
    where
        G: FnMut() -> String,
    {
        let mut entries = self.entries.lock();
        let id = loop {
            let candidate = generate();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(id.clone(), event);
        id
    }

    /// Remove the entry for `id`, if still present.
    pub fn resolve(&self, id: &str) -> Option<InFlightEvent> {
        self.entries.lock().remove(id)
    }

    /// Remove and return every entry older than the timeout.
    pub fn drain_expired(&self) -> Vec<(String, InFlightEvent)> {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, ev)| ev.is_expired(self.timeout))
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|ev| (id, ev)))
            .collect()
    }

    pub fn drain_all(&self) -> Vec<(String, InFlightEvent)> {
        self.entries.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn event(payload: &str) -> InFlightEvent {
        InFlightEvent {
            payload: payload.into(),
            enqueued_at: Instant::now(),
            settlable: Settlable::new(),
        }
    }

    #[test]
    fn regenerates_on_collision() {
        let table = InFlightTable::new(Duration::from_secs(5));
        let mut ids = vec!["BBBB", "AAAA", "AAAA"];
        let first = table.insert_with(|| "AAAA".to_string(), event("a"));
        assert_eq!(first, "AAAA");
        let second = table.insert_with(|| ids.pop().unwrap_or("CCCC").to_string(), event("b"));
        assert_eq!(second, "BBBB");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn resolve_removes_exactly_once() {
        let table = InFlightTable::new(Duration::from_secs(5));
        let id = table.insert_with(|| "AbC0".to_string(), event("volume 3"));
        let hit = table.resolve(&id).expect("present");
        assert_eq!(hit.payload, "volume 3");
        assert!(table.resolve(&id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn drain_expired_only_takes_old_entries() {
        let table = InFlightTable::new(Duration::from_millis(100));
        let mut old = event("old");
        old.enqueued_at = Instant::now() - Duration::from_secs(1);
        table.insert_with(|| "OLD0".to_string(), old);
        table.insert_with(|| "NEW0".to_string(), event("new"));

        let expired = table.drain_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "OLD0");
        assert_eq!(table.len(), 1);
        assert!(table.drain_expired().is_empty());
    }

    #[test]
    fn drain_all_empties_table() {
        let table = InFlightTable::new(Duration::from_secs(5));
        table.insert_with(|| "AAAA".to_string(), event("a"));
        table.insert_with(|| "BBBB".to_string(), event("b"));
        assert_eq!(table.drain_all().len(), 2);
        assert!(table.is_empty());
    }
}
