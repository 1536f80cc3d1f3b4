//! Per-run existence cache.
//!
//! Shared by every concurrently running stage, so entries sit behind a mutex.
//! Absent IDs are cached too, which keeps a repeated miss from re-querying the
//! destination inside the TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::destination::ExistingRow;

/// What the destination last said about an ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    Absent,
    Present(ExistingRow),
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: Existence,
    captured_at: Instant,
}

#[derive(Debug)]
pub struct ExistenceCache {
    ttl: Duration,
    entries: Mutex<HashMap<i64, CacheEntry>>,
}

impl ExistenceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, CacheEntry>> {
        // A poisoned map only means a panic elsewhere mid-insert; the data is
        // still a valid map of complete entries.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The cached answer for `id`, if it is younger than the TTL.
    pub fn get(&self, id: i64) -> Option<Existence> {
        let entries = self.lock();
        entries
            .get(&id)
            .filter(|e| e.captured_at.elapsed() < self.ttl)
            .map(|e| e.value)
    }

    pub fn insert(&self, id: i64, value: Existence) {
        self.lock().insert(
            id,
            CacheEntry {
                value,
                captured_at: Instant::now(),
            },
        );
    }

    /// Drop everything. Called at the start of each run.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Entries held, expired ones included.
    pub fn entry_count(&self) -> usize {
        self.lock().len()
    }
}
