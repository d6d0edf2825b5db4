//! Per-key single-flight mutex registry
//!
//! Used to coalesce concurrent site compilations for the same
//! `(owner, repo)`. Entries are created on demand and retained: the memory
//! cost is proportional to the set of keys ever locked, which is bounded by
//! the set of repositories the gateway has served.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct Locker {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Locker {
    pub fn new() -> Self {
        Locker::default()
    }

    /// Return the mutex for `key`, creating it on first use.
    pub fn open(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
