//! Coalescing work queue keyed by `(identity, persona)`.
//!
//! Holds at most one pending payload per key; a newer submission replaces
//! the older one before it is processed. Draining swaps the whole map out
//! under the lock, so submitters never wait on processing.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Owner of a unit of background work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkKey {
    pub identity: String,
    pub persona: String,
}

impl WorkKey {
    pub fn new(identity: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            persona: persona.into(),
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identity, self.persona)
    }
}

/// Last-write-wins map of pending work.
#[derive(Debug)]
pub struct CoalescingQueue<P> {
    pending: Mutex<HashMap<WorkKey, P>>,
}

impl<P> Default for CoalescingQueue<P> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<P> CoalescingQueue<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `payload` for `key`. Returns `true` if it replaced unconsumed work.
    pub fn submit(&self, key: WorkKey, payload: P) -> bool {
        mutex_lock(&self.pending).insert(key, payload).is_some()
    }

    /// Take everything pending, one item per key.
    pub fn drain(&self) -> Vec<(WorkKey, P)> {
        let taken = std::mem::take(&mut *mutex_lock(&self.pending));
        let mut items: Vec<(WorkKey, P)> = taken.into_iter().collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
