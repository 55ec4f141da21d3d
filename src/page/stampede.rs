//! Decides whether a request replays a snapshot, regenerates it, or bypasses the cache.
//!
//! Pages are only cached once they see enough traffic: each request near or
//! past a snapshot's expiry bumps a per-fingerprint counter, and only when the
//! counter reaches the threshold does a single lock holder regenerate. Every
//! other request keeps replaying the old snapshot meanwhile.

use std::sync::Arc;

use tracing::debug;

use super::config::PageCacheConfig;
use super::fingerprint::RequestFingerprint;
use super::lock::GenerationLock;
use super::snapshot::PageSnapshot;
use crate::cache::CacheAdapter;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// Serve the stored snapshot. `stale` is set when it is expired or outdated.
    Replay {
        snapshot: Box<PageSnapshot>,
        stale: bool,
    },
    /// This request holds the generation lock and must capture its response.
    Generate { version: i64 },
    /// Render normally without storing anything.
    Bypass,
}

#[derive(Debug, Clone)]
pub struct StampedeController {
    config: Arc<PageCacheConfig>,
    lock: GenerationLock,
}

impl StampedeController {
    pub fn new(config: Arc<PageCacheConfig>) -> Self {
        let lock = GenerationLock::new(config.group.clone(), config.lock_ttl_seconds);
        Self { config, lock }
    }

    pub fn lock(&self) -> &GenerationLock {
        &self.lock
    }

    pub fn decide(
        &self,
        cache: &mut CacheAdapter,
        fingerprint: &RequestFingerprint,
        now: i64,
    ) -> CacheDecision {
        let group = self.config.group.as_str();
        cache.add_global_groups([group]);
        let version = cache
            .get::<i64>(&fingerprint.version_key(), group, false)
            .unwrap_or(0);
        let snapshot = cache.get::<PageSnapshot>(fingerprint.snapshot_key(), group, false);

        let outdated = snapshot
            .as_ref()
            .is_some_and(|snapshot| snapshot.version != version);
        let regenerate =
            outdated || self.wants_regeneration(cache, fingerprint, snapshot.as_ref(), now);
        let locked = regenerate && self.lock.acquire(cache, fingerprint);

        let decision = match snapshot {
            Some(snapshot) if !locked => {
                let fresh = snapshot.is_fresh(now);
                if fresh || (regenerate && self.config.use_stale) {
                    CacheDecision::Replay {
                        snapshot: Box::new(snapshot),
                        stale: !fresh || outdated,
                    }
                } else {
                    CacheDecision::Bypass
                }
            }
            _ if locked => CacheDecision::Generate { version },
            _ => CacheDecision::Bypass,
        };

        debug!(
            key = fingerprint.key(),
            version,
            regenerate,
            locked,
            decision = decision.label(),
            "page cache decision"
        );
        decision
    }

    fn wants_regeneration(
        &self,
        cache: &mut CacheAdapter,
        fingerprint: &RequestFingerprint,
        snapshot: Option<&PageSnapshot>,
        now: i64,
    ) -> bool {
        let expired = snapshot.is_none_or(|snapshot| !snapshot.is_fresh(now));
        if !self.config.sampling_enabled() {
            return expired;
        }

        let window = self.config.sample_window_seconds;
        if snapshot.is_some_and(|snapshot| !snapshot.is_near_expiry(now, window)) {
            return false;
        }

        let group = self.config.group.as_str();
        let counter = fingerprint.counter_key();
        cache.add(&counter, &0, group, window);
        let requests = cache.increment(&counter, 1, group).unwrap_or(0);
        if requests < i64::from(self.config.sample_threshold) || !expired {
            return false;
        }
        cache.delete(&counter, group);
        true
    }
}

impl CacheDecision {
    pub fn label(&self) -> &'static str {
        match self {
            CacheDecision::Replay { stale: false, .. } => "hit",
            CacheDecision::Replay { stale: true, .. } => "stale",
            CacheDecision::Generate { .. } => "generate",
            CacheDecision::Bypass => "bypass",
        }
    }
}
