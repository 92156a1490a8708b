//! Near cache — the first read source for session records.
//!
//! Process-local, TTL'd, bounded. Expired entries are dropped on read; when
//! the cache is full the oldest entry makes room for the new one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use kiln_model::Session;

/// Configuration for the near cache.
#[derive(Debug, Clone)]
pub struct NearCacheConfig {
    /// Entry lifetime (default: 10 minutes).
    pub ttl: Duration,
    /// Maximum entries (default: 5000).
    pub max_entries: usize,
}

impl Default for NearCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_entries: 5000,
        }
    }
}

struct Entry {
    session: Session,
    inserted_at: Instant,
}

struct CacheState {
    entries: HashMap<String, Entry>,
    ttl: Duration,
}

/// TTL'd, bounded, process-local session cache.
pub struct NearCache {
    state: Mutex<CacheState>,
    max_entries: usize,
}

impl NearCache {
    /// Create a cache with the given shape.
    pub fn new(config: NearCacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                ttl: config.ttl,
            }),
            max_entries: config.max_entries,
        }
    }

    /// Insert or replace a record. Evicts the oldest entry when full.
    pub fn insert(&self, session: Session) {
        let mut state = self.state.lock().expect("near cache lock poisoned");
        if state.entries.len() >= self.max_entries && !state.entries.contains_key(&session.id) {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                state.entries.remove(&id);
            }
        }
        state.entries.insert(
            session.id.clone(),
            Entry {
                session,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Fetch a live record; expired entries are removed and miss.
    pub fn get(&self, id: &str) -> Option<Session> {
        let mut state = self.state.lock().expect("near cache lock poisoned");
        let ttl = state.ttl;
        match state.entries.get(id) {
            Some(entry) if entry.inserted_at.elapsed() < ttl => Some(entry.session.clone()),
            Some(_) => {
                state.entries.remove(id);
                None
            }
            None => None,
        }
    }

    /// Remove a record. Returns whether it was present (live or expired).
    pub fn remove(&self, id: &str) -> bool {
        self.state
            .lock()
            .expect("near cache lock poisoned")
            .entries
            .remove(id)
            .is_some()
    }

    /// All live records.
    pub fn snapshot(&self) -> Vec<Session> {
        let state = self.state.lock().expect("near cache lock poisoned");
        state
            .entries
            .values()
            .filter(|e| e.inserted_at.elapsed() < state.ttl)
            .map(|e| e.session.clone())
            .collect()
    }

    /// Drop all expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut state = self.state.lock().expect("near cache lock poisoned");
        let ttl = state.ttl;
        let before = state.entries.len();
        state.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        before - state.entries.len()
    }

    /// Current entry count, including not-yet-evicted expired entries.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("near cache lock poisoned")
            .entries
            .len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the TTL (tests only).
    pub(crate) fn set_ttl(&self, ttl: Duration) {
        self.state.lock().expect("near cache lock poisoned").ttl = ttl;
    }
}
