//! Remote key-value backends.
//!
//! Every call returns [`BackendResult`]; callers decide how to degrade. Values
//! travel as JSON text so that integers stay compatible with the store's
//! native counters.

mod memory;
mod redis_backend;

use std::time::Duration;

use thiserror::Error;

pub use memory::MemoryBackend;
pub use redis_backend::{RedisBackend, RedisConnector};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend connection failed: {0}")]
    Connect(String),
    #[error("backend authentication failed: {0}")]
    Auth(String),
    #[error("backend operation `{op}` timed out")]
    Timeout { op: &'static str },
    #[error("backend operation `{op}` failed: {message}")]
    Operation { op: &'static str, message: String },
    #[error("backend is unavailable")]
    Unavailable,
}

impl BackendError {
    pub fn operation(op: &'static str, message: impl Into<String>) -> Self {
        Self::Operation {
            op,
            message: message.into(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Call contract required of a concrete store.
///
/// A connection is owned by exactly one adapter, hence `&mut self`.
pub trait Backend: Send {
    fn ping(&mut self) -> BackendResult<()>;

    fn get(&mut self, key: &str) -> BackendResult<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> BackendResult<()>;

    fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) -> BackendResult<()>;

    /// Atomic set-if-absent. Returns whether the value was written.
    fn set_if_absent(&mut self, key: &str, value: &str, ttl: Option<Duration>)
    -> BackendResult<bool>;

    /// Atomic set-if-present. Returns whether the value was written.
    fn set_if_present(
        &mut self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool>;

    /// Atomically add `delta` to an existing integer counter, keeping its TTL.
    /// Returns `None` without creating anything when the key is absent.
    fn incr_existing(&mut self, key: &str, delta: i64) -> BackendResult<Option<i64>>;

    /// Floating-point counterpart of [`Backend::incr_existing`].
    fn incr_existing_float(&mut self, key: &str, delta: f64) -> BackendResult<Option<f64>>;

    fn delete(&mut self, key: &str) -> BackendResult<bool>;

    fn flush_all(&mut self) -> BackendResult<()>;

    /// Delete every key starting with `prefix`, returning how many went away.
    fn delete_matching(&mut self, prefix: &str) -> BackendResult<u64>;

    fn select(&mut self, _database: i64) -> BackendResult<()> {
        Ok(())
    }

    fn auth(&mut self, _credential: &str) -> BackendResult<()> {
        Ok(())
    }
}

/// Opens backend connections; one connection per adapter.
pub trait BackendConnector: Send + Sync {
    fn connect(&self) -> BackendResult<Box<dyn Backend>>;
}
