//! In-memory implementation of CoordinationStore for testing

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::store::{CoordinationStore, StoreError, WindowDecision};

/// A plain key with optional expiry
struct KeyEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KeyEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Sorted set ordered by (score, member)
#[derive(Default)]
struct SortedSet {
    entries: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn add(&mut self, member: &str, score: i64) {
        self.entries.retain(|(_, m)| m != member);
        self.entries.insert((score, member.to_string()));
    }

    fn remove_up_to(&mut self, max_score: i64) -> u64 {
        let before = self.entries.len();
        self.entries.retain(|(score, _)| *score > max_score);
        (before - self.entries.len()) as u64
    }

    fn oldest(&self) -> Option<(String, i64)> {
        self.entries
            .iter()
            .next()
            .map(|(score, member)| (member.clone(), *score))
    }
}

#[derive(Default)]
struct State {
    keys: HashMap<String, KeyEntry>,
    sorted: HashMap<String, SortedSet>,
}

impl State {
    /// Drop the key if it has expired and return the live entry, if any
    fn live_key(&mut self, key: &str, now: Instant) -> Option<&mut KeyEntry> {
        if self.keys.get(key).is_some_and(|e| !e.is_live(now)) {
            self.keys.remove(key);
        }
        self.keys.get_mut(key)
    }
}

/// In-memory implementation of CoordinationStore
///
/// Stands in for the shared store when every worker lives in one process
/// (tests, local development). Expiry is driven by `tokio::time`, so tests
/// running with a paused clock can fast-forward lock TTLs.
///
/// # Example
///
/// ```
/// use jobguard_durable::InMemoryCoordinationStore;
///
/// let store = InMemoryCoordinationStore::new();
/// ```
pub struct InMemoryCoordinationStore {
    state: Mutex<State>,
}

impl InMemoryCoordinationStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Number of live plain keys
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .keys
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.keys.clear();
        state.sorted.clear();
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.state.lock();
        Ok(state.live_key(key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.live_key(key, now).is_some() {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let existed = state.live_key(key, now).is_some();
        state.keys.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.live_key(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.live_key(key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let matches = state
            .live_key(key, now)
            .is_some_and(|entry| entry.value == expected);
        if matches {
            state.keys.remove(key);
        }
        Ok(matches)
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.state
            .lock()
            .sorted
            .entry(key.to_string())
            .or_default()
            .add(member, score);
        Ok(())
    }

    async fn sorted_remove_up_to(&self, key: &str, max_score: i64) -> Result<u64, StoreError> {
        Ok(self
            .state
            .lock()
            .sorted
            .get_mut(key)
            .map_or(0, |set| set.remove_up_to(max_score)))
    }

    async fn sorted_count(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self
            .state
            .lock()
            .sorted
            .get(key)
            .map_or(0, |set| set.entries.len() as u64))
    }

    async fn sorted_oldest(&self, key: &str) -> Result<Option<(String, i64)>, StoreError> {
        Ok(self.state.lock().sorted.get(key).and_then(SortedSet::oldest))
    }

    async fn window_admit(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window: Duration,
        capacity: u32,
    ) -> Result<WindowDecision, StoreError> {
        let cutoff = now_ms - window.as_millis() as i64;
        let mut state = self.state.lock();
        let set = state.sorted.entry(key.to_string()).or_default();
        set.remove_up_to(cutoff);

        if (set.entries.len() as u64) < u64::from(capacity) {
            set.add(member, now_ms);
            return Ok(WindowDecision::Admitted);
        }

        // capacity is at least one entry here, so the set is non-empty
        let oldest_ms = set.oldest().map_or(now_ms, |(_, score)| score);
        Ok(WindowDecision::Rejected { oldest_ms })
    }
}
