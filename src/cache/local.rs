//! Process-local cache tier (L1).
//!
//! Holds JSON values keyed by the full cache key. Reads hand out clones, so a
//! caller mutating what it got back never touches the cached copy.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

#[derive(Debug, Clone)]
struct LocalEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
pub struct LocalCache {
    entries: HashMap<String, LocalEntry>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.live(key).map(|entry| entry.value.clone())
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        self.entries.insert(
            key.into(),
            LocalEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    /// Remove a key, returning whether a live value was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries
            .remove(key)
            .is_some_and(|entry| !entry.is_expired())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| !entry.is_expired())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add `delta` to an existing value; non-numeric values count as zero.
    ///
    /// Returns `None` when the key is absent.
    pub fn increment(&mut self, key: &str, delta: i64) -> Option<i64> {
        let entry = self.live_mut(key)?;
        let next = integer_of(&entry.value).saturating_add(delta);
        entry.value = Value::from(next);
        Some(next)
    }

    pub fn increment_float(&mut self, key: &str, delta: f64) -> Option<f64> {
        let entry = self.live_mut(key)?;
        let next = float_of(&entry.value) + delta;
        entry.value = Value::from(next);
        Some(next)
    }

    fn live(&mut self, key: &str) -> Option<&LocalEntry> {
        self.live_mut(key).map(|entry| &*entry)
    }

    fn live_mut(&mut self, key: &str) -> Option<&mut LocalEntry> {
        if self.entries.get(key).is_some_and(LocalEntry::is_expired) {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }
}

fn integer_of(value: &Value) -> i64 {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(text) => text.trim().parse().unwrap_or(0),
        Value::Bool(true) => 1,
        _ => 0,
    }
}

fn float_of(value: &Value) -> f64 {
    match value {
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        Value::String(text) => text.trim().parse().unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    }
}
