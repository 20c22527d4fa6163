//! Bounded duplicate suppression for change notifications.
//!
//! A watch can report the same state several times (reconnects, overlapping
//! snapshots, the same write seen by two listeners). Events are keyed by the
//! fixture, the kind of change, the score values and the timestamp; a key
//! already in the cache is a duplicate. The cache is an LRU with a fixed
//! capacity so a long-lived subscription cannot grow it without bound.

use std::collections::{HashMap, VecDeque};

use crate::db::models::{ChangeEvent, ChangeKind, FixtureKey};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    fixture: FixtureKey,
    kind: ChangeKind,
    /// "a_goals-a_points:b_goals-b_points", empty when the event had no score
    score: String,
    timestamp_ms: i64,
}

impl DedupKey {
    pub fn of(event: &ChangeEvent) -> Self {
        DedupKey {
            fixture: event.fixture.clone(),
            kind: event.kind,
            score: event
                .score
                .map(|s| format!("{}:{}", s.team_a, s.team_b))
                .unwrap_or_default(),
            timestamp_ms: event.timestamp.timestamp_millis(),
        }
    }
}

pub struct DedupCache {
    capacity: usize,
    /// key → generation of its most recent admission
    entries: HashMap<DedupKey, u64>,
    /// (key, generation) in admission order; entries whose generation no
    /// longer matches `entries` are stale and skipped on eviction
    order: VecDeque<(DedupKey, u64)>,
    generation: u64,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        DedupCache {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            generation: 0,
        }
    }

    /// `true` if the event has not been seen among the most recent
    /// `capacity` distinct events. Either way the event becomes the most
    /// recently seen.
    pub fn admit(&mut self, event: &ChangeEvent) -> bool {
        let key = DedupKey::of(event);
        self.generation += 1;
        let generation = self.generation;

        let novel = match self.entries.get_mut(&key) {
            Some(g) => {
                *g = generation;
                false
            }
            None => {
                self.entries.insert(key.clone(), generation);
                true
            }
        };
        self.order.push_back((key, generation));

        while self.entries.len() > self.capacity {
            self.evict_oldest();
        }
        if self.order.len() > self.capacity * 2 {
            self.compact();
        }
        novel
    }

    /// The novel events of a batch, in arrival order. Duplicates within the
    /// batch itself are dropped too.
    pub fn admit_batch(&mut self, events: Vec<ChangeEvent>) -> Vec<ChangeEvent> {
        events.into_iter().filter(|ev| self.admit(ev)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_oldest(&mut self) {
        while let Some((key, generation)) = self.order.pop_front() {
            if self.entries.get(&key) == Some(&generation) {
                self.entries.remove(&key);
                return;
            }
        }
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.order.retain(|(key, generation)| entries.get(key) == Some(generation));
    }
}
