//! Shared cache of compiled glob matchers
//!
//! Filter path patterns repeat across requests for the same site, so the
//! compiled matchers are kept in a small LRU shared by all requests.
//! `*` does not cross `/`; `**` does (GitHub-Pages-style patterns).

use crate::error::{PagesError, Result};
use globset::{GlobBuilder, GlobMatcher};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct Slot {
    matcher: GlobMatcher,
    last_used: Instant,
}

pub struct GlobCache {
    capacity: usize,
    slots: Mutex<HashMap<String, Slot>>,
}

/// Compile a pattern with the gateway's glob semantics.
pub fn compile(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| PagesError::validation(format!("invalid glob pattern {}: {}", pattern, e)))
}

impl GlobCache {
    pub fn new(capacity: usize) -> Self {
        GlobCache {
            capacity: capacity.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, pattern: &str) -> Result<GlobMatcher> {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(pattern) {
            slot.last_used = now;
            return Ok(slot.matcher.clone());
        }
        let matcher = compile(pattern)?;
        if slots.len() >= self.capacity {
            if let Some(oldest) = slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(key, _)| key.clone())
            {
                slots.remove(&oldest);
            }
        }
        slots.insert(
            pattern.to_string(),
            Slot {
                matcher: matcher.clone(),
                last_used: now,
            },
        );
        Ok(matcher)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
