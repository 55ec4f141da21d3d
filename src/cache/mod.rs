//! Object cache.
//!
//! Two tiers behind one facade:
//!
//! - **Local tier**: per-adapter map consulted first, never shared.
//! - **Backend tier**: a remote key-value store shared by every request process.
//!
//! ## Configuration
//!
//! Backend and group behavior is controlled via `pagecache.toml`:
//!
//! ```toml
//! [backend]
//! url = "redis://127.0.0.1:6379"
//! operation_timeout_ms = 500
//!
//! [cache]
//! key_prefix = "site_"
//! global_groups = ["users", "site-options"]
//! ignored_groups = ["counts"]
//! ```

mod adapter;
pub mod backend;
mod config;
mod keys;
mod local;

pub use adapter::{CacheAdapter, CacheStats};
pub use backend::{
    Backend, BackendConnector, BackendError, BackendResult, MemoryBackend, RedisBackend,
    RedisConnector,
};
pub use config::{BackendSettings, CacheConfig, FlushMode};
pub use keys::{DEFAULT_GROUP, GroupClass, GroupRegistry, KeyBuilder, hash_hex, sanitize};
pub use local::LocalCache;
