//! Redis backend over a synchronous connection with bounded timeouts.

use std::sync::LazyLock;
use std::time::Duration;

use ::redis::{Commands, Connection, ErrorKind, RedisError, Script};
use tracing::debug;

use super::{Backend, BackendConnector, BackendError, BackendResult};
use crate::cache::config::BackendSettings;

const DELETE_BATCH: usize = 500;

// INCRBY on a missing key would create it without a TTL.
static INCR_EXISTING: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"if redis.call('EXISTS', KEYS[1]) == 1 then return redis.call('INCRBY', KEYS[1], ARGV[1]) end return false",
    )
});

static INCR_EXISTING_FLOAT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"if redis.call('EXISTS', KEYS[1]) == 1 then return redis.call('INCRBYFLOAT', KEYS[1], ARGV[1]) end return false",
    )
});

/// Opens one [`RedisBackend`] per call.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    settings: BackendSettings,
}

impl RedisConnector {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

impl BackendConnector for RedisConnector {
    fn connect(&self) -> BackendResult<Box<dyn Backend>> {
        Ok(Box::new(RedisBackend::connect(&self.settings)?))
    }
}

pub struct RedisBackend {
    connection: Connection,
}

impl RedisBackend {
    /// Connect, authenticate and select the configured database.
    pub fn connect(settings: &BackendSettings) -> BackendResult<Self> {
        let client = ::redis::Client::open(settings.url.as_str())
            .map_err(|err| BackendError::Connect(err.to_string()))?;
        let connection = client
            .get_connection_with_timeout(settings.connect_timeout)
            .map_err(|err| classify("connect", err))?;
        connection
            .set_read_timeout(Some(settings.operation_timeout))
            .map_err(|err| classify("connect", err))?;
        connection
            .set_write_timeout(Some(settings.operation_timeout))
            .map_err(|err| classify("connect", err))?;

        let mut backend = Self { connection };
        if let Some(password) = settings.password.as_deref() {
            backend.auth(password)?;
        }
        if let Some(database) = settings.database {
            backend.select(database)?;
        }

        debug!(database = ?settings.database, "connected to redis backend");
        Ok(backend)
    }

    fn conditional_set(
        &mut self,
        op: &'static str,
        condition: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg(condition);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(expiry_seconds(ttl));
        }
        let reply: Option<String> = cmd
            .query(&mut self.connection)
            .map_err(|err| classify(op, err))?;
        Ok(reply.is_some())
    }
}

impl Backend for RedisBackend {
    fn ping(&mut self) -> BackendResult<()> {
        let _: String = ::redis::cmd("PING")
            .query(&mut self.connection)
            .map_err(|err| classify("ping", err))?;
        Ok(())
    }

    fn get(&mut self, key: &str) -> BackendResult<Option<String>> {
        self.connection
            .get(key)
            .map_err(|err| classify("get", err))
    }

    fn set(&mut self, key: &str, value: &str) -> BackendResult<()> {
        self.connection
            .set(key, value)
            .map_err(|err| classify("set", err))
    }

    fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) -> BackendResult<()> {
        ::redis::cmd("SETEX")
            .arg(key)
            .arg(expiry_seconds(ttl))
            .arg(value)
            .query(&mut self.connection)
            .map_err(|err| classify("setex", err))
    }

    fn set_if_absent(
        &mut self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        self.conditional_set("set_nx", "NX", key, value, ttl)
    }

    fn set_if_present(
        &mut self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        self.conditional_set("set_xx", "XX", key, value, ttl)
    }

    fn incr_existing(&mut self, key: &str, delta: i64) -> BackendResult<Option<i64>> {
        INCR_EXISTING
            .key(key)
            .arg(delta)
            .invoke(&mut self.connection)
            .map_err(|err| classify("incrby", err))
    }

    fn incr_existing_float(&mut self, key: &str, delta: f64) -> BackendResult<Option<f64>> {
        INCR_EXISTING_FLOAT
            .key(key)
            .arg(delta)
            .invoke(&mut self.connection)
            .map_err(|err| classify("incrbyfloat", err))
    }

    fn delete(&mut self, key: &str) -> BackendResult<bool> {
        let removed: i64 = ::redis::cmd("DEL")
            .arg(key)
            .query(&mut self.connection)
            .map_err(|err| classify("del", err))?;
        Ok(removed > 0)
    }

    fn flush_all(&mut self) -> BackendResult<()> {
        ::redis::cmd("FLUSHDB")
            .query(&mut self.connection)
            .map_err(|err| classify("flushdb", err))
    }

    fn delete_matching(&mut self, prefix: &str) -> BackendResult<u64> {
        let pattern = format!("{}*", escape_glob(prefix));
        let keys: Vec<String> = self
            .connection
            .scan_match(pattern)
            .map_err(|err| classify("scan", err))?
            .collect();

        let mut removed = 0u64;
        for batch in keys.chunks(DELETE_BATCH) {
            let count: u64 = ::redis::cmd("DEL")
                .arg(batch)
                .query(&mut self.connection)
                .map_err(|err| classify("del", err))?;
            removed += count;
        }
        Ok(removed)
    }

    fn select(&mut self, database: i64) -> BackendResult<()> {
        ::redis::cmd("SELECT")
            .arg(database)
            .query(&mut self.connection)
            .map_err(|err| classify("select", err))
    }

    fn auth(&mut self, credential: &str) -> BackendResult<()> {
        ::redis::cmd("AUTH")
            .arg(credential)
            .query(&mut self.connection)
            .map_err(|err| match err.kind() {
                ErrorKind::AuthenticationFailed => BackendError::Auth(err.to_string()),
                _ => classify("auth", err),
            })
    }
}

/// Redis rejects a zero expiry; sub-second TTLs round up.
fn expiry_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn classify(op: &'static str, err: RedisError) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout { op }
    } else if err.kind() == ErrorKind::AuthenticationFailed {
        BackendError::Auth(err.to_string())
    } else if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
        BackendError::Connect(err.to_string())
    } else {
        BackendError::operation(op, err.to_string())
    }
}

fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
