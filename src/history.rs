//! Size-bounded in-memory record stores.
//!
//! Components receive an `Arc<BoundedHistory<_>>` instead of owning growing
//! vectors; the oldest entries are evicted once the capacity is reached.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Hard ceiling regardless of configuration.
pub const MAX_HISTORY_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub struct BoundedHistory<T> {
    inner: Mutex<VecDeque<T>>,
    cap: usize,
}

impl<T: Clone> BoundedHistory<T> {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, MAX_HISTORY_CAPACITY);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    pub fn push(&self, entry: T) {
        let mut v = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        v.push_back(entry);
        while v.len() > self.cap {
            v.pop_front();
        }
    }

    /// Oldest-first copy of the newest `n` entries.
    pub fn snapshot_last_n(&self, n: usize) -> Vec<T> {
        let v = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let start = v.len().saturating_sub(n);
        v.iter().skip(start).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.snapshot_last_n(self.cap)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}
