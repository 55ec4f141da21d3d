//! Request-scoped object cache facade.
//!
//! Orchestrates the local tier and the backend. Backend failures never reach
//! the caller: the adapter marks the backend down for the rest of its life,
//! routes global groups to the local tier and carries on.

use std::thread;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use super::backend::{Backend, BackendConnector, BackendError, RedisConnector};
use super::config::{CacheConfig, FlushMode};
use super::keys::{GroupRegistry, KeyBuilder};
use super::local::LocalCache;

const METRIC_OBJECT_HIT: &str = "pagecache_object_hit_total";
const METRIC_OBJECT_MISS: &str = "pagecache_object_miss_total";
const METRIC_BACKEND_FAILURE: &str = "pagecache_backend_failure_total";

/// Connection state and hit counts for this adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub connected: bool,
    pub hits: u64,
    pub misses: u64,
}

pub struct CacheAdapter {
    backend: Option<Box<dyn Backend>>,
    connected: bool,
    local: LocalCache,
    groups: GroupRegistry,
    keys: KeyBuilder,
    scope: u64,
    flush_mode: FlushMode,
    hits: u64,
    misses: u64,
}

impl std::fmt::Debug for CacheAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAdapter")
            .field("connected", &self.connected)
            .field("scope", &self.scope)
            .field("groups", &self.groups)
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish_non_exhaustive()
    }
}

impl CacheAdapter {
    /// Adapter without any backend; every group lives in the local tier.
    pub fn local(config: &CacheConfig) -> Self {
        Self::build(None, config)
    }

    /// Connect to the configured Redis backend, or fall back to [`CacheAdapter::local`].
    pub fn connect(config: &CacheConfig) -> Self {
        match config.backend.as_ref() {
            Some(settings) => Self::open(&RedisConnector::new(settings.clone()), config),
            None => Self::local(config),
        }
    }

    /// Open a backend connection through `connector`.
    ///
    /// A connection failure yields an adapter that is already degraded.
    pub fn open(connector: &dyn BackendConnector, config: &CacheConfig) -> Self {
        match connector.connect() {
            Ok(backend) => Self::with_backend(backend, config),
            Err(err) => {
                let mut adapter = Self::build(None, config);
                adapter.degrade("connect", err);
                adapter
            }
        }
    }

    /// Wrap an already open backend, checking it with a ping.
    pub fn with_backend(backend: Box<dyn Backend>, config: &CacheConfig) -> Self {
        let mut adapter = Self::build(Some(backend), config);
        adapter.connected = true;
        if let Err(err) = adapter.backend_call(|backend| backend.ping()) {
            adapter.degrade("ping", err);
        }
        adapter
    }

    fn build(backend: Option<Box<dyn Backend>>, config: &CacheConfig) -> Self {
        Self {
            backend,
            connected: false,
            local: LocalCache::new(),
            groups: GroupRegistry::new(
                config.global_groups.iter().cloned(),
                config.ignored_groups.iter().cloned(),
            ),
            keys: KeyBuilder::new(config.key_prefix.clone()),
            scope: config.scope,
            flush_mode: config.flush_mode,
            hits: 0,
            misses: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn scope(&self) -> u64 {
        self.scope
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            connected: self.connected,
            hits: self.hits,
            misses: self.misses,
        }
    }

    /// Write only if the key does not exist yet.
    #[instrument(level = "trace", skip(self, value))]
    pub fn add<T: Serialize + ?Sized>(&mut self, key: &str, value: &T, group: &str, ttl: u64) -> bool {
        let Some(value) = encode(key, value) else {
            return false;
        };
        let (full_key, persisted) = self.resolve(key, group);

        if !persisted {
            if self.local.contains(&full_key) {
                return false;
            }
            self.local.insert(full_key, value, expiry(ttl));
            return true;
        }

        let text = value.to_string();
        match self.backend_call(|backend| backend.set_if_absent(&full_key, &text, expiry(ttl))) {
            Ok(true) => {
                self.local.insert(full_key, value, expiry(ttl));
                true
            }
            Ok(false) => {
                debug!(key, group, "add skipped: key exists");
                false
            }
            Err(err) => {
                self.degrade("add", err);
                false
            }
        }
    }

    /// Overwrite only if the key already exists.
    #[instrument(level = "trace", skip(self, value))]
    pub fn replace<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
        group: &str,
        ttl: u64,
    ) -> bool {
        let Some(value) = encode(key, value) else {
            return false;
        };
        let (full_key, persisted) = self.resolve(key, group);

        if !persisted {
            if !self.local.contains(&full_key) {
                return false;
            }
            self.local.insert(full_key, value, expiry(ttl));
            return true;
        }

        let text = value.to_string();
        match self.backend_call(|backend| backend.set_if_present(&full_key, &text, expiry(ttl))) {
            Ok(true) => {
                self.local.insert(full_key, value, expiry(ttl));
                true
            }
            Ok(false) => {
                debug!(key, group, "replace skipped: key missing");
                false
            }
            Err(err) => {
                self.degrade("replace", err);
                false
            }
        }
    }

    /// Unconditional upsert.
    #[instrument(level = "trace", skip(self, value))]
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T, group: &str, ttl: u64) -> bool {
        let Some(value) = encode(key, value) else {
            return false;
        };
        let (full_key, persisted) = self.resolve(key, group);

        if !persisted {
            self.local.insert(full_key, value, expiry(ttl));
            return true;
        }

        let text = value.to_string();
        let written = self.backend_call(|backend| match expiry(ttl) {
            Some(ttl) => backend.set_with_expiry(&full_key, &text, ttl),
            None => backend.set(&full_key, &text),
        });
        match written {
            Ok(()) => {
                self.local.insert(full_key, value, expiry(ttl));
                true
            }
            Err(err) => {
                self.degrade("set", err);
                false
            }
        }
    }

    /// Fetch a value; `force` skips the local tier and rereads the backend.
    #[instrument(level = "trace", skip(self))]
    pub fn get<T: DeserializeOwned>(&mut self, key: &str, group: &str, force: bool) -> Option<T> {
        let (full_key, persisted) = self.resolve(key, group);

        if !force && let Some(value) = self.local.get(&full_key) {
            return self.finish_lookup(key, group, Some(value));
        }

        if !persisted {
            return self.finish_lookup(key, group, None);
        }

        let value = match self.backend_call(|backend| backend.get(&full_key)) {
            Ok(Some(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Null | Value::Bool(false)) => None,
                Ok(value) => {
                    self.local.insert(full_key, value.clone(), None);
                    Some(value)
                }
                Err(err) => {
                    warn!(key, group, error = %err, "discarding undecodable cache value");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                self.degrade("get", err);
                None
            }
        };
        self.finish_lookup(key, group, value)
    }

    /// Remove a key from both tiers.
    #[instrument(level = "trace", skip(self))]
    pub fn delete(&mut self, key: &str, group: &str) -> bool {
        let (full_key, persisted) = self.resolve(key, group);
        let removed_local = self.local.remove(&full_key);
        if !persisted {
            return removed_local;
        }

        match self.backend_call(|backend| backend.delete(&full_key)) {
            Ok(removed) => removed || removed_local,
            Err(err) => {
                self.degrade("delete", err);
                removed_local
            }
        }
    }

    pub fn increment(&mut self, key: &str, offset: i64, group: &str) -> Option<i64> {
        self.adjust(key, offset, group)
    }

    pub fn decrement(&mut self, key: &str, offset: i64, group: &str) -> Option<i64> {
        self.adjust(key, offset.checked_neg()?, group)
    }

    /// Floating-point counterpart of [`CacheAdapter::increment`]; pass a negative offset to decrement.
    pub fn increment_float(&mut self, key: &str, offset: f64, group: &str) -> Option<f64> {
        let (full_key, persisted) = self.resolve(key, group);
        if !persisted {
            return self.local.increment_float(&full_key, offset);
        }

        let outcome =
            self.backend_call(|backend| backend.incr_existing_float(&full_key, offset));
        match outcome {
            Ok(Some(value)) => {
                self.local.insert(full_key, Value::from(value), None);
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                self.degrade("incrbyfloat", err);
                self.local.increment_float(&full_key, offset)
            }
        }
    }

    #[instrument(level = "trace", skip(self))]
    fn adjust(&mut self, key: &str, offset: i64, group: &str) -> Option<i64> {
        let (full_key, persisted) = self.resolve(key, group);
        if !persisted {
            return self.local.increment(&full_key, offset);
        }

        // One atomic call; concurrent adapters serialize on the backend.
        let outcome = self.backend_call(|backend| backend.incr_existing(&full_key, offset));
        match outcome {
            Ok(Some(value)) => {
                self.local.insert(full_key, Value::from(value), None);
                Some(value)
            }
            Ok(None) => None,
            Err(err) => {
                self.degrade("incrby", err);
                self.local.increment(&full_key, offset)
            }
        }
    }

    /// Clear the local tier and, when connected, the backend namespace.
    ///
    /// A non-zero `delay` blocks the caller first.
    #[instrument(level = "debug", skip(self))]
    pub fn flush(&mut self, delay: Duration) -> bool {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.local.clear();

        if !self.connected {
            return true;
        }

        let outcome = match self.flush_mode {
            FlushMode::All => self.backend_call(|backend| backend.flush_all()),
            FlushMode::Scope => {
                let prefix = self.keys.scope_prefix(self.scope);
                self.backend_call(|backend| backend.delete_matching(&prefix))
                    .map(|removed| debug!(removed, prefix = %prefix, "flushed scope"))
            }
        };
        match outcome {
            Ok(()) => true,
            Err(err) => {
                self.degrade("flush", err);
                false
            }
        }
    }

    pub fn switch_scope(&mut self, scope: u64) -> bool {
        self.scope = scope;
        true
    }

    /// Mark groups as shared across scopes; while the backend is down they become ignored instead.
    pub fn add_global_groups<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.connected {
            self.groups.add_global(groups);
        } else {
            self.groups.add_ignored(groups);
        }
    }

    pub fn add_non_persistent_groups<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.add_ignored(groups);
    }

    /// Full key plus whether the backend is involved.
    ///
    /// The key depends on global membership only, so demoting a group after a
    /// failure changes where it is stored but not what the local tier calls it.
    fn resolve(&self, key: &str, group: &str) -> (String, bool) {
        let global = self.groups.is_global(group);
        let full_key = self.keys.build(self.scope, global, group, key);
        let persisted = self.groups.classify(group).is_persisted();
        (full_key, persisted && self.connected)
    }

    fn backend_call<T, F>(&mut self, call: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut dyn Backend) -> Result<T, BackendError>,
    {
        if !self.connected {
            return Err(BackendError::Unavailable);
        }
        match self.backend.as_deref_mut() {
            Some(backend) => call(backend),
            None => Err(BackendError::Unavailable),
        }
    }

    fn degrade(&mut self, op: &'static str, err: BackendError) {
        let was_connected = self.connected;
        self.connected = false;
        self.groups.demote_global();
        counter!(METRIC_BACKEND_FAILURE, "op" => op).increment(1);
        error!(
            op,
            error = %err,
            was_connected,
            "cache backend failure; continuing with local cache only"
        );
    }

    fn finish_lookup<T: DeserializeOwned>(
        &mut self,
        key: &str,
        group: &str,
        value: Option<Value>,
    ) -> Option<T> {
        let decoded = value.and_then(|value| match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(key, group, error = %err, "cached value has an unexpected shape");
                None
            }
        });

        if decoded.is_some() {
            self.hits += 1;
            counter!(METRIC_OBJECT_HIT).increment(1);
        } else {
            self.misses += 1;
            counter!(METRIC_OBJECT_MISS).increment(1);
        }
        decoded
    }
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, error = %err, "refusing to cache a value that cannot be serialized");
            None
        }
    }
}

fn expiry(ttl: u64) -> Option<Duration> {
    (ttl > 0).then(|| Duration::from_secs(ttl))
}
