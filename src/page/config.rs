//! Page cache configuration.

/// Seconds a snapshot outlives its sampling window in the backend.
pub const EXPIRY_GRACE_SECONDS: u64 = 30;

const DEFAULT_GROUP: &str = "pagecache";
const DEFAULT_MAX_AGE_SECONDS: u64 = 600;
const DEFAULT_SAMPLE_WINDOW_SECONDS: u64 = 120;
const DEFAULT_SAMPLE_THRESHOLD: u32 = 2;
const DEFAULT_LOCK_TTL_SECONDS: u64 = 10;
const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Page cache configuration from `pagecache.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCacheConfig {
    /// Serve and capture pages at all.
    pub enabled: bool,
    /// Object cache group holding snapshots, counters and locks.
    pub group: String,
    /// Freshness of a snapshot unless the response carries `Cache-Control: max-age`.
    pub max_age_seconds: u64,
    /// Window in which requests are counted before a page is cached; 0 disables sampling.
    pub sample_window_seconds: u64,
    /// Requests within the window needed before caching; below 2 disables sampling.
    pub sample_threshold: u32,
    /// Lifetime of a generation lock.
    pub lock_ttl_seconds: u64,
    /// Serve an expired snapshot while another request regenerates it.
    pub use_stale: bool,
    /// Store and replay redirects.
    pub cache_redirects: bool,
    /// Emit `Last-Modified`/`Cache-Control` and honor `If-Modified-Since`.
    pub cache_control: bool,
    /// Response headers never stored in a snapshot.
    pub uncached_headers: Vec<String>,
    /// Requests carrying a cookie with one of these name prefixes skip the page cache.
    pub bypass_cookie_prefixes: Vec<String>,
    /// Add an `x-page-cache` header describing the outcome.
    pub debug_header: bool,
    /// Largest response body the middleware buffers for capture.
    pub max_body_bytes: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: DEFAULT_GROUP.to_string(),
            max_age_seconds: DEFAULT_MAX_AGE_SECONDS,
            sample_window_seconds: DEFAULT_SAMPLE_WINDOW_SECONDS,
            sample_threshold: DEFAULT_SAMPLE_THRESHOLD,
            lock_ttl_seconds: DEFAULT_LOCK_TTL_SECONDS,
            use_stale: true,
            cache_redirects: false,
            cache_control: true,
            uncached_headers: vec!["transfer-encoding".to_string()],
            bypass_cookie_prefixes: Vec::new(),
            debug_header: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl PageCacheConfig {
    /// Returns true if traffic is sampled before pages get cached.
    pub fn sampling_enabled(&self) -> bool {
        self.sample_window_seconds > 0 && self.sample_threshold >= 2
    }

    /// Backend TTL for a snapshot with the given max age.
    pub fn snapshot_ttl(&self, max_age_seconds: u64) -> u64 {
        max_age_seconds
            .saturating_add(self.sample_window_seconds)
            .saturating_add(EXPIRY_GRACE_SECONDS)
    }

    pub fn is_uncached_header(&self, name: &str) -> bool {
        self.uncached_headers
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(name))
    }
}
