//! Per-fingerprint generation lock.
//!
//! At most one request regenerates a page at a time. The lock is an atomic
//! add of `<fingerprint>_genlock` with a short TTL, so a crashed holder frees
//! it on expiry.

use tracing::debug;

use super::fingerprint::RequestFingerprint;
use crate::cache::CacheAdapter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationLock {
    group: String,
    ttl_seconds: u64,
}

impl GenerationLock {
    pub fn new(group: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            group: group.into(),
            ttl_seconds: ttl_seconds.max(1),
        }
    }

    /// Try to take the lock. Returns true for exactly one caller until release or expiry.
    pub fn acquire(&self, cache: &mut CacheAdapter, fingerprint: &RequestFingerprint) -> bool {
        self.share(cache);
        let acquired = cache.add(&fingerprint.lock_key(), &1, &self.group, self.ttl_seconds);
        debug!(key = fingerprint.key(), acquired, "generation lock attempt");
        acquired
    }

    pub fn release(&self, cache: &mut CacheAdapter, fingerprint: &RequestFingerprint) -> bool {
        self.share(cache);
        cache.delete(&fingerprint.lock_key(), &self.group)
    }

    pub fn is_held(&self, cache: &mut CacheAdapter, fingerprint: &RequestFingerprint) -> bool {
        self.share(cache);
        cache
            .get::<i64>(&fingerprint.lock_key(), &self.group, true)
            .is_some()
    }

    /// Lock keys live in the global scope of whichever adapter is handed in.
    fn share(&self, cache: &mut CacheAdapter) {
        cache.add_global_groups([self.group.as_str()]);
    }
}
