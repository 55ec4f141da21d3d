//! Full-page HTTP cache on top of the object cache.
//!
//! A request is fingerprinted, then either replayed from a stored snapshot or
//! generated downstream and captured. Regeneration is sampled and serialized
//! through a per-fingerprint lock so a busy page is rebuilt by one request at
//! a time while the rest keep getting the previous copy.
//!
//! ```toml
//! [page]
//! max_age_seconds = 300
//! sample_window_seconds = 120
//! sample_threshold = 2
//! cache_redirects = true
//! ```

mod capture;
mod clock;
mod config;
mod fingerprint;
mod headers;
mod lock;
mod middleware;
mod replay;
mod snapshot;
mod stampede;

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info};
use url::Url;

pub use capture::{CaptureOutcome, CaptureSession, SkipReason};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EXPIRY_GRACE_SECONDS, PageCacheConfig};
pub use fingerprint::{RequestFingerprint, RequestInfo};
pub use headers::HeaderBag;
pub use lock::GenerationLock;
pub use middleware::{DEBUG_HEADER, PageCacheState, page_cache_layer};
pub use replay::{ReplayKind, ReplayResponse, replay};
pub use snapshot::{PageSnapshot, SnapshotError, format_http_date, parse_http_date};
pub use stampede::{CacheDecision, StampedeController};

use crate::cache::CacheAdapter;

pub(crate) const METRIC_PAGE_OUTCOME: &str = "pagecache_page_outcome_total";
pub(crate) const METRIC_GENERATION_MS: &str = "pagecache_generation_ms";

/// Why a request skipped the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Disabled,
    Method,
    Cookie,
    /// Not yet eligible, or another request is regenerating without a servable snapshot.
    NotEligible,
}

impl BypassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BypassReason::Disabled => "disabled",
            BypassReason::Method => "method",
            BypassReason::Cookie => "cookie",
            BypassReason::NotEligible => "not_eligible",
        }
    }
}

/// What the host should do with a request.
#[derive(Debug)]
pub enum PageOutcome {
    /// Send this response; downstream generation is skipped.
    Replay(ReplayResponse),
    /// Generate downstream and hand the result to the session.
    Capture(CaptureSession),
    /// Generate downstream; nothing is stored.
    Bypass(BypassReason),
}

#[derive(Debug, Clone)]
pub struct PageCache {
    config: Arc<PageCacheConfig>,
    clock: Arc<dyn Clock>,
    controller: StampedeController,
}

impl PageCache {
    pub fn new(config: PageCacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: PageCacheConfig, clock: Arc<dyn Clock>) -> Self {
        let config = Arc::new(config);
        Self {
            controller: StampedeController::new(config.clone()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &PageCacheConfig {
        &self.config
    }

    /// Serve path: decide between replay, capture and bypass for `request`.
    ///
    /// `pending` holds headers the live response already carries.
    pub fn begin(
        &self,
        cache: &mut CacheAdapter,
        request: &RequestInfo,
        pending: &HeaderBag,
    ) -> PageOutcome {
        let bypass = if !self.config.enabled {
            Some(BypassReason::Disabled)
        } else if !request.is_cacheable_method() {
            Some(BypassReason::Method)
        } else if request.has_cookie_with_prefix(&self.config.bypass_cookie_prefixes) {
            Some(BypassReason::Cookie)
        } else {
            None
        };
        if let Some(reason) = bypass {
            return self.bypass(reason);
        }

        let fingerprint = RequestFingerprint::of(request);
        let now = self.clock.now();

        match self.controller.decide(cache, &fingerprint, now) {
            CacheDecision::Replay { snapshot, stale } => {
                let outcome = if stale { "stale" } else { "hit" };
                counter!(METRIC_PAGE_OUTCOME, "outcome" => outcome).increment(1);
                let mut response = replay(&snapshot, request, pending, &self.config, now);
                response.stale = stale;
                debug!(key = fingerprint.key(), kind = ?response.kind, stale, "replaying snapshot");
                PageOutcome::Replay(response)
            }
            CacheDecision::Generate { version } => {
                counter!(METRIC_PAGE_OUTCOME, "outcome" => "miss").increment(1);
                PageOutcome::Capture(CaptureSession::new(
                    self.config.clone(),
                    self.controller.lock().clone(),
                    fingerprint,
                    version,
                    now,
                ))
            }
            CacheDecision::Bypass => self.bypass(BypassReason::NotEligible),
        }
    }

    /// Bump the content version of a URL so every cached variant regenerates.
    ///
    /// Returns the new version, or `None` when the counter could not be bumped.
    pub fn invalidate_url(&self, cache: &mut CacheAdapter, url: &Url) -> Option<i64> {
        let group = self.config.group.as_str();
        cache.add_global_groups([group]);

        let mut host = url.host_str().unwrap_or_default().to_string();
        if let Some(port) = url.port() {
            host = format!("{host}:{port}");
        }
        let url_key = RequestFingerprint::url_key_for(url.scheme(), &host, url.path());
        let key = fingerprint::version_key(&url_key);

        cache.add(&key, &0, group, 0);
        let version = cache.increment(&key, 1, group);
        info!(url = %url, ?version, "invalidated page");
        version
    }

    fn bypass(&self, reason: BypassReason) -> PageOutcome {
        counter!(METRIC_PAGE_OUTCOME, "outcome" => "bypass").increment(1);
        debug!(reason = reason.as_str(), "page cache bypassed");
        PageOutcome::Bypass(reason)
    }
}
