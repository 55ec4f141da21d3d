//! Object cache configuration.
//!
//! Controls the backend connection, key namespace and group seeds via `pagecache.toml`.

use std::time::Duration;

// Default values for cache configuration
const DEFAULT_KEY_PREFIX: &str = "";
const DEFAULT_SCOPE: u64 = 1;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 500;
const DEFAULT_GLOBAL_GROUPS: &[&str] = &[
    "networks",
    "site-options",
    "site-transient",
    "users",
    "userlogins",
];
const DEFAULT_IGNORED_GROUPS: &[&str] = &["counts", "plugins"];

/// How `flush` clears the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Flush the whole backend database.
    #[default]
    All,
    /// Delete only the keys belonging to the current scope.
    Scope,
}

/// Connection settings for the remote store.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Database index selected after connecting.
    pub database: Option<i64>,
    /// Credential sent with `AUTH` after connecting.
    pub password: Option<String>,
    /// Upper bound for establishing the connection.
    pub connect_timeout: Duration,
    /// Upper bound for a single read or write.
    pub operation_timeout: Duration,
}

impl BackendSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: None,
            password: None,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
        }
    }
}

/// Object cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Remote store; `None` keeps every group in the local cache.
    pub backend: Option<BackendSettings>,
    /// Prepended to every backend key.
    pub key_prefix: String,
    /// Initial scope (site id) for non-global groups.
    pub scope: u64,
    /// Groups shared across scopes.
    pub global_groups: Vec<String>,
    /// Groups never sent to the backend.
    pub ignored_groups: Vec<String>,
    pub flush_mode: FlushMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            scope: DEFAULT_SCOPE,
            global_groups: DEFAULT_GLOBAL_GROUPS.iter().map(|g| g.to_string()).collect(),
            ignored_groups: DEFAULT_IGNORED_GROUPS.iter().map(|g| g.to_string()).collect(),
            flush_mode: FlushMode::default(),
        }
    }
}

impl CacheConfig {
    /// Returns true if a remote store is configured.
    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Builder-style helper used by tests and embedders.
    pub fn with_backend(mut self, settings: BackendSettings) -> Self {
        self.backend = Some(settings);
        self
    }
}
