//! In-process backend shared between adapters.
//!
//! Clones share one store, so several adapters behave like several request
//! processes talking to one server. Used for local deployments without Redis
//! and throughout the test suite.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{Backend, BackendConnector, BackendError, BackendResult};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &str, ttl: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryBackend {
    entries: Arc<DashMap<String, StoredValue>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle availability for every clone; while unavailable all calls fail.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw stored text, bypassing availability. Test inspection only.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    fn check(&self) -> BackendResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable)
        }
    }

    fn live(&self, key: &str) -> Option<String> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_expired() => {
                entry.remove();
                None
            }
            Entry::Occupied(entry) => Some(entry.get().value.clone()),
            Entry::Vacant(_) => None,
        }
    }

    /// Read-modify-write under the entry lock; absent or expired keys are left absent.
    fn update_number<T, F>(&self, op: &'static str, key: &str, apply: F) -> BackendResult<Option<T>>
    where
        T: std::str::FromStr + ToString + Copy,
        F: FnOnce(T) -> T,
    {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_expired() => {
                entry.remove();
                Ok(None)
            }
            Entry::Occupied(mut entry) => {
                let current = entry.get().value.parse::<T>().map_err(|_| {
                    BackendError::operation(op, "value is not a number or out of range")
                })?;
                let next = apply(current);
                entry.get_mut().value = next.to_string();
                Ok(Some(next))
            }
            Entry::Vacant(_) => Ok(None),
        }
    }
}

impl Backend for MemoryBackend {
    fn ping(&mut self) -> BackendResult<()> {
        self.check()
    }

    fn get(&mut self, key: &str) -> BackendResult<Option<String>> {
        self.check()?;
        Ok(self.live(key))
    }

    fn set(&mut self, key: &str, value: &str) -> BackendResult<()> {
        self.check()?;
        self.entries
            .insert(key.to_string(), StoredValue::new(value, None));
        Ok(())
    }

    fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        self.check()?;
        self.entries
            .insert(key.to_string(), StoredValue::new(value, Some(ttl)));
        Ok(())
    }

    fn set_if_absent(
        &mut self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        self.check()?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) if entry.get().is_expired() => {
                entry.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    fn set_if_present(
        &mut self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        self.check()?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) if entry.get().is_expired() => {
                entry.remove();
                Ok(false)
            }
            Entry::Occupied(mut entry) => {
                entry.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    fn incr_existing(&mut self, key: &str, delta: i64) -> BackendResult<Option<i64>> {
        self.check()?;
        self.update_number("incrby", key, |current: i64| current.wrapping_add(delta))
    }

    fn incr_existing_float(&mut self, key: &str, delta: f64) -> BackendResult<Option<f64>> {
        self.check()?;
        self.update_number("incrbyfloat", key, |current: f64| current + delta)
    }

    fn delete(&mut self, key: &str) -> BackendResult<bool> {
        self.check()?;
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired()))
    }

    fn flush_all(&mut self) -> BackendResult<()> {
        self.check()?;
        self.entries.clear();
        Ok(())
    }

    fn delete_matching(&mut self, prefix: &str) -> BackendResult<u64> {
        self.check()?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - self.entries.len()) as u64)
    }
}

impl BackendConnector for MemoryBackend {
    fn connect(&self) -> BackendResult<Box<dyn Backend>> {
        self.check()?;
        Ok(Box::new(self.clone()))
    }
}
