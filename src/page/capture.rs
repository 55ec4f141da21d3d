//! Capture of a freshly generated response into a snapshot.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use tracing::{debug, info};

use super::config::PageCacheConfig;
use super::fingerprint::RequestFingerprint;
use super::headers::HeaderBag;
use super::lock::GenerationLock;
use super::snapshot::{PageSnapshot, format_http_date};
use super::{METRIC_GENERATION_MS, METRIC_PAGE_OUTCOME};
use crate::cache::CacheAdapter;

/// Why a generated response was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyBody,
    ServerError,
    SetCookie,
    WriteFailed,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::EmptyBody => "empty_body",
            SkipReason::ServerError => "server_error",
            SkipReason::SetCookie => "set_cookie",
            SkipReason::WriteFailed => "write_failed",
        }
    }
}

/// Result of [`CaptureSession::on_output_ready`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    /// Body to send; always the generated body, untouched.
    pub body: Bytes,
    /// Headers to add to the live response if it does not carry them yet.
    pub headers: HeaderBag,
    pub stored: bool,
    pub skipped: Option<SkipReason>,
}

/// A generation in progress. Owns the generation lock until finished or abandoned.
#[derive(Debug)]
pub struct CaptureSession {
    config: Arc<PageCacheConfig>,
    lock: GenerationLock,
    fingerprint: RequestFingerprint,
    version: i64,
    created_at: i64,
    started: Instant,
    status_line: Option<String>,
    status_code: u16,
    redirect: Option<(u16, String)>,
    captured: HeaderBag,
}

impl CaptureSession {
    pub(crate) fn new(
        config: Arc<PageCacheConfig>,
        lock: GenerationLock,
        fingerprint: RequestFingerprint,
        version: i64,
        created_at: i64,
    ) -> Self {
        Self {
            config,
            lock,
            fingerprint,
            version,
            created_at,
            started: Instant::now(),
            status_line: None,
            status_code: 200,
            redirect: None,
            captured: HeaderBag::new(),
        }
    }

    pub fn fingerprint(&self) -> &RequestFingerprint {
        &self.fingerprint
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn on_status_line(&mut self, line: impl Into<String>, code: u16) -> u16 {
        self.status_line = Some(line.into());
        self.status_code = code;
        code
    }

    pub fn on_redirect(&mut self, code: u16, location: impl Into<String>) -> u16 {
        if self.config.cache_redirects {
            self.redirect = Some((code, location.into()));
        }
        code
    }

    /// Record a header set during generation that may not appear among the sent headers.
    pub fn capture_header(&mut self, name: &str, value: impl Into<String>) {
        self.captured.append(name, value);
    }

    /// Decide cacheability, persist the snapshot and release the lock.
    pub fn on_output_ready(
        self,
        cache: &mut CacheAdapter,
        sent: &HeaderBag,
        body: Bytes,
    ) -> CaptureOutcome {
        let elapsed = self.started.elapsed();
        histogram!(METRIC_GENERATION_MS).record(elapsed.as_secs_f64() * 1000.0);
        cache.add_global_groups([self.config.group.as_str()]);

        let mut headers = sent.clone();
        headers.merge(&self.captured);
        for name in headers.names().map(str::to_string).collect::<Vec<_>>() {
            if self.config.is_uncached_header(&name) {
                headers.remove(&name);
            }
        }

        if let Some(reason) = self.uncacheable(&headers, &body) {
            return self.skip(cache, body, reason);
        }

        let max_age = headers
            .get("cache-control")
            .and_then(|values| values.iter().find_map(|value| max_age_directive(value)))
            .unwrap_or(self.config.max_age_seconds);
        let expires_at_offset = self.config.snapshot_ttl(max_age);
        let (redirect_status, redirect_location) = match &self.redirect {
            Some((status, location)) => (Some(*status), Some(location.clone())),
            None => (None, None),
        };

        let snapshot = PageSnapshot {
            output: body.clone(),
            created_at: self.created_at,
            headers: headers.clone(),
            gen_duration_seconds: elapsed.as_secs_f64(),
            status_line: self.status_line.clone(),
            redirect_status,
            redirect_location,
            version: self.version,
            max_age_seconds: max_age,
            expires_at_offset,
        };

        let group = self.config.group.as_str();
        if !cache.set(self.fingerprint.snapshot_key(), &snapshot, group, expires_at_offset) {
            return self.skip(cache, body, SkipReason::WriteFailed);
        }
        self.lock.release(cache, &self.fingerprint);

        let mut extra = HeaderBag::new();
        if self.config.cache_control {
            if !headers.contains("last-modified")
                && let Some(date) = format_http_date(self.created_at)
            {
                extra.insert("last-modified", date);
            }
            if !headers.contains("cache-control") {
                extra.insert(
                    "cache-control",
                    format!("max-age={max_age}, must-revalidate"),
                );
            }
        }

        counter!(METRIC_PAGE_OUTCOME, "outcome" => "stored").increment(1);
        info!(
            key = self.fingerprint.key(),
            version = self.version,
            max_age,
            bytes = body.len(),
            "stored page snapshot"
        );
        CaptureOutcome {
            body,
            headers: extra,
            stored: true,
            skipped: None,
        }
    }

    /// Give up on this generation, releasing the lock.
    pub fn abandon(self, cache: &mut CacheAdapter) {
        debug!(key = self.fingerprint.key(), "generation abandoned");
        self.lock.release(cache, &self.fingerprint);
    }

    fn uncacheable(&self, headers: &HeaderBag, body: &Bytes) -> Option<SkipReason> {
        if self.redirect.is_none() && body.iter().all(u8::is_ascii_whitespace) {
            return Some(SkipReason::EmptyBody);
        }
        if (500..600).contains(&self.status_code) {
            return Some(SkipReason::ServerError);
        }
        if headers.contains("set-cookie") {
            return Some(SkipReason::SetCookie);
        }
        None
    }

    fn skip(self, cache: &mut CacheAdapter, body: Bytes, reason: SkipReason) -> CaptureOutcome {
        self.lock.release(cache, &self.fingerprint);
        counter!(METRIC_PAGE_OUTCOME, "outcome" => reason.as_str()).increment(1);
        debug!(
            key = self.fingerprint.key(),
            reason = reason.as_str(),
            "response not cached"
        );
        CaptureOutcome {
            body,
            headers: HeaderBag::new(),
            stored: false,
            skipped: Some(reason),
        }
    }
}

/// `max-age=N` (or the legacy `maxage=N`) from a `Cache-Control` value.
fn max_age_directive(value: &str) -> Option<u64> {
    value.split(',').find_map(|directive| {
        let (name, seconds) = directive.trim().split_once('=')?;
        let name = name.trim();
        if name.eq_ignore_ascii_case("max-age") || name.eq_ignore_ascii_case("maxage") {
            seconds.trim().trim_matches('"').parse().ok()
        } else {
            None
        }
    })
}
