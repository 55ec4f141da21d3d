//! Replay of a stored snapshot.

use bytes::Bytes;

use super::config::PageCacheConfig;
use super::fingerprint::RequestInfo;
use super::headers::HeaderBag;
use super::snapshot::{PageSnapshot, format_http_date, parse_http_date};

const REDIRECT_CODES: [u16; 8] = [300, 301, 302, 303, 304, 305, 306, 307];
const FALLBACK_REDIRECT: u16 = 302;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayKind {
    Full,
    NotModified,
    Redirect,
}

/// Response rebuilt from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResponse {
    pub kind: ReplayKind,
    pub status: u16,
    pub status_line: Option<String>,
    pub headers: HeaderBag,
    pub body: Bytes,
    /// Served while another request regenerates the page.
    pub stale: bool,
}

/// Build the response for `request` out of `snapshot`.
///
/// `pending` are headers the live response already carries; they win over the stored ones.
pub fn replay(
    snapshot: &PageSnapshot,
    request: &RequestInfo,
    pending: &HeaderBag,
    config: &PageCacheConfig,
    now: i64,
) -> ReplayResponse {
    let mut headers = pending.layered_over(&snapshot.headers);

    if config.cache_control && !snapshot.headers.contains("last-modified") {
        if !headers.contains("last-modified")
            && let Some(date) = format_http_date(snapshot.created_at)
        {
            headers.insert("last-modified", date);
        }
        if !headers.contains("cache-control") {
            let remaining = snapshot.expires_at().saturating_sub(now).max(0);
            headers.insert(
                "cache-control",
                format!("max-age={remaining}, must-revalidate"),
            );
        }
    }

    if not_modified(snapshot, &headers, request, config) {
        return ReplayResponse {
            kind: ReplayKind::NotModified,
            status: 304,
            status_line: None,
            headers,
            body: Bytes::new(),
            stale: false,
        };
    }

    if config.cache_redirects
        && let Some((status, location)) = snapshot.redirect()
    {
        let status = if REDIRECT_CODES.contains(&status) {
            status
        } else {
            FALLBACK_REDIRECT
        };
        headers.insert("location", location);
        return ReplayResponse {
            kind: ReplayKind::Redirect,
            status,
            status_line: None,
            headers,
            body: Bytes::new(),
            stale: false,
        };
    }

    ReplayResponse {
        kind: ReplayKind::Full,
        status: snapshot.status_code(),
        status_line: snapshot.status_line.clone(),
        headers,
        body: snapshot.output.clone(),
        stale: false,
    }
}

fn not_modified(
    snapshot: &PageSnapshot,
    headers: &HeaderBag,
    request: &RequestInfo,
    config: &PageCacheConfig,
) -> bool {
    if let (Some(expected), Some(etag)) = (request.if_none_match.as_deref(), headers.first("etag"))
        && expected.trim() == etag.trim()
    {
        return true;
    }

    if !config.cache_control {
        return false;
    }
    request
        .if_modified_since
        .as_deref()
        .and_then(parse_http_date)
        .is_some_and(|since| since >= snapshot.last_modified())
}
