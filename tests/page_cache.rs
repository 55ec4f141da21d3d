use std::sync::Arc;

use bytes::Bytes;
use pagecache::cache::{CacheAdapter, CacheConfig, MemoryBackend};
use pagecache::page::{
    BypassReason, CaptureSession, HeaderBag, ManualClock, PageCache, PageCacheConfig,
    PageOutcome, PageSnapshot, ReplayKind, ReplayResponse, RequestFingerprint, RequestInfo,
    SkipReason,
};
use url::Url;

const START: i64 = 1_700_000_000;

struct Harness {
    backend: MemoryBackend,
    clock: Arc<ManualClock>,
    page_cache: PageCache,
}

impl Harness {
    fn new(config: PageCacheConfig) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        Self {
            backend: MemoryBackend::new(),
            page_cache: PageCache::with_clock(config, clock.clone()),
            clock,
        }
    }

    /// Sampling off: the first request generates.
    fn unsampled() -> Self {
        Self::new(PageCacheConfig {
            sample_window_seconds: 0,
            ..Default::default()
        })
    }

    fn adapter(&self) -> CacheAdapter {
        CacheAdapter::open(&self.backend, &CacheConfig::default())
    }

    fn begin(&self, request: &RequestInfo) -> PageOutcome {
        self.page_cache
            .begin(&mut self.adapter(), request, &HeaderBag::new())
    }

    fn finish(&self, session: CaptureSession, sent: &HeaderBag, body: &'static [u8]) -> bool {
        session
            .on_output_ready(&mut self.adapter(), sent, Bytes::from_static(body))
            .stored
    }

    fn stored_snapshot(&self, request: &RequestInfo) -> Option<PageSnapshot> {
        let mut cache = self.adapter();
        cache.add_global_groups(["pagecache"]);
        cache.get(RequestFingerprint::of(request).snapshot_key(), "pagecache", true)
    }
}

fn get(path: &str) -> RequestInfo {
    RequestInfo::new("GET", "https", "example.com", path)
}

fn html() -> HeaderBag {
    [("content-type", "text/html; charset=utf-8")]
        .into_iter()
        .collect()
}

fn expect_capture(outcome: PageOutcome) -> CaptureSession {
    match outcome {
        PageOutcome::Capture(session) => session,
        other => panic!("expected capture, got {other:?}"),
    }
}

fn expect_replay(outcome: PageOutcome) -> ReplayResponse {
    match outcome {
        PageOutcome::Replay(response) => response,
        other => panic!("expected replay, got {other:?}"),
    }
}

#[test]
fn generated_page_is_replayed_with_last_modified() {
    let harness = Harness::unsampled();
    let request = get("/foo");

    let mut session = expect_capture(harness.begin(&request));
    session.on_status_line("HTTP/1.1 200 OK", 200);
    assert!(harness.finish(session, &html(), b"<h1>foo</h1>"));

    let snapshot = harness.stored_snapshot(&request).expect("snapshot stored");
    assert_eq!(snapshot.max_age_seconds, 600);
    assert_eq!(snapshot.expires_at_offset, 600 + 30);
    assert_eq!(snapshot.created_at, START);

    harness.clock.advance(1);
    let replayed = expect_replay(harness.begin(&request));
    assert_eq!(replayed.kind, ReplayKind::Full);
    assert_eq!(replayed.status, 200);
    assert_eq!(replayed.body, Bytes::from_static(b"<h1>foo</h1>"));
    assert!(!replayed.stale);
    assert_eq!(
        replayed.headers.first("last-modified"),
        Some("Tue, 14 Nov 2023 22:13:20 GMT")
    );
    assert_eq!(
        replayed.headers.first("content-type"),
        Some("text/html; charset=utf-8")
    );
}

#[test]
fn matching_etag_replays_not_modified() {
    let harness = Harness::unsampled();
    let mut sent = html();
    sent.append("ETag", "\"abc\"");

    let session = expect_capture(harness.begin(&get("/etag")));
    assert!(harness.finish(session, &sent, b"tagged"));

    let conditional = get("/etag").with_if_none_match("\"abc\"");
    let replayed = expect_replay(harness.begin(&conditional));
    assert_eq!(replayed.kind, ReplayKind::NotModified);
    assert_eq!(replayed.status, 304);
    assert!(replayed.body.is_empty());
}

#[test]
fn cached_redirect_is_replayed_without_generation() {
    let harness = Harness::new(PageCacheConfig {
        sample_window_seconds: 0,
        cache_redirects: true,
        ..Default::default()
    });
    let request = get("/old");

    let mut session = expect_capture(harness.begin(&request));
    session.on_status_line("HTTP/1.1 301 Moved Permanently", 301);
    session.on_redirect(301, "/bar");
    let sent: HeaderBag = [("location", "/bar")].into_iter().collect();
    assert!(harness.finish(session, &sent, b""));

    let replayed = expect_replay(harness.begin(&request));
    assert_eq!(replayed.kind, ReplayKind::Redirect);
    assert_eq!(replayed.status, 301);
    assert_eq!(replayed.headers.first("location"), Some("/bar"));
}

#[test]
fn redirects_are_not_cached_when_disabled() {
    let harness = Harness::unsampled();
    let mut session = expect_capture(harness.begin(&get("/old")));
    session.on_status_line("HTTP/1.1 301 Moved Permanently", 301);
    session.on_redirect(301, "/bar");

    let sent: HeaderBag = [("location", "/bar")].into_iter().collect();
    let outcome = session.on_output_ready(&mut harness.adapter(), &sent, Bytes::new());
    assert!(!outcome.stored);
    assert_eq!(outcome.skipped, Some(SkipReason::EmptyBody));
}

#[test]
fn set_cookie_prevents_storage_and_regenerates_next_time() {
    let harness = Harness::unsampled();
    let request = get("/account");
    let mut sent = html();
    sent.append("Set-Cookie", "session=abc; HttpOnly");

    let session = expect_capture(harness.begin(&request));
    let outcome = session.on_output_ready(
        &mut harness.adapter(),
        &sent,
        Bytes::from_static(b"personal"),
    );
    assert!(!outcome.stored);
    assert_eq!(outcome.skipped, Some(SkipReason::SetCookie));
    assert_eq!(outcome.body, Bytes::from_static(b"personal"));
    assert!(harness.stored_snapshot(&request).is_none());

    expect_capture(harness.begin(&request));
}

#[test]
fn server_errors_and_blank_bodies_are_not_stored() {
    let harness = Harness::unsampled();

    let mut failing = expect_capture(harness.begin(&get("/broken")));
    failing.on_status_line("HTTP/1.1 503 Service Unavailable", 503);
    let outcome =
        failing.on_output_ready(&mut harness.adapter(), &html(), Bytes::from_static(b"down"));
    assert_eq!(outcome.skipped, Some(SkipReason::ServerError));

    let blank = expect_capture(harness.begin(&get("/blank")));
    let outcome =
        blank.on_output_ready(&mut harness.adapter(), &html(), Bytes::from_static(b" \n\t"));
    assert_eq!(outcome.skipped, Some(SkipReason::EmptyBody));
}

#[test]
fn sampling_threshold_of_two_delays_generation() {
    let harness = Harness::new(PageCacheConfig::default());
    let request = get("/popular");

    assert!(matches!(
        harness.begin(&request),
        PageOutcome::Bypass(BypassReason::NotEligible)
    ));
    let session = expect_capture(harness.begin(&request));
    assert!(harness.finish(session, &html(), b"popular"));

    let replayed = expect_replay(harness.begin(&request));
    assert_eq!(replayed.body, Bytes::from_static(b"popular"));
}

#[test]
fn only_one_request_regenerates_at_a_time() {
    let harness = Harness::unsampled();
    let request = get("/busy");

    let session = expect_capture(harness.begin(&request));
    assert!(matches!(
        harness.begin(&request),
        PageOutcome::Bypass(BypassReason::NotEligible)
    ));

    session.abandon(&mut harness.adapter());
    expect_capture(harness.begin(&request));
}

#[test]
fn stale_snapshot_is_served_while_another_request_regenerates() {
    let harness = Harness::unsampled();
    let request = get("/news");

    let session = expect_capture(harness.begin(&request));
    assert!(harness.finish(session, &html(), b"old news"));

    harness.clock.advance(700);
    let regenerating = expect_capture(harness.begin(&request));

    let waiting = expect_replay(harness.begin(&request));
    assert!(waiting.stale);
    assert_eq!(waiting.body, Bytes::from_static(b"old news"));

    assert!(harness.finish(regenerating, &html(), b"fresh news"));
    let fresh = expect_replay(harness.begin(&request));
    assert!(!fresh.stale);
    assert_eq!(fresh.body, Bytes::from_static(b"fresh news"));
}

#[test]
fn cache_control_max_age_overrides_the_default() {
    let harness = Harness::unsampled();
    let request = get("/short");
    let mut sent = html();
    sent.append("Cache-Control", "public, max-age=60");

    let session = expect_capture(harness.begin(&request));
    assert!(harness.finish(session, &sent, b"short lived"));

    let snapshot = harness.stored_snapshot(&request).expect("snapshot stored");
    assert_eq!(snapshot.max_age_seconds, 60);
    assert_eq!(snapshot.expires_at_offset, 90);

    harness.clock.advance(61);
    expect_capture(harness.begin(&request));
}

#[test]
fn blocked_headers_are_not_stored() {
    let harness = Harness::unsampled();
    let request = get("/chunked");
    let mut sent = html();
    sent.append("Transfer-Encoding", "chunked");

    let mut session = expect_capture(harness.begin(&request));
    session.capture_header("X-Generator", "pagecache-test");
    assert!(harness.finish(session, &sent, b"chunks"));

    let snapshot = harness.stored_snapshot(&request).expect("snapshot stored");
    assert!(!snapshot.headers.contains("transfer-encoding"));
    assert_eq!(snapshot.headers.first("x-generator"), Some("pagecache-test"));
}

#[test]
fn invalidate_url_forces_regeneration_of_every_variant() {
    let harness = Harness::unsampled();
    let plain = get("/about");
    let paged = get("/about").with_query("page=2");

    for request in [&plain, &paged] {
        let session = expect_capture(harness.begin(request));
        assert!(harness.finish(session, &html(), b"about v0"));
    }

    let url = Url::parse("https://example.com/about").expect("url");
    assert_eq!(
        harness
            .page_cache
            .invalidate_url(&mut harness.adapter(), &url),
        Some(1)
    );

    let session = expect_capture(harness.begin(&plain));
    assert_eq!(session.version(), 1);
    let waiting = expect_replay(harness.begin(&plain));
    assert!(waiting.stale);
    assert!(harness.finish(session, &html(), b"about v1"));

    let regenerated = expect_replay(harness.begin(&plain));
    assert_eq!(regenerated.body, Bytes::from_static(b"about v1"));
    assert!(!regenerated.stale);

    expect_capture(harness.begin(&paged));
}

#[test]
fn ineligible_requests_bypass_the_cache() {
    let harness = Harness::new(PageCacheConfig {
        sample_window_seconds: 0,
        bypass_cookie_prefixes: vec!["logged_in_".to_string()],
        ..Default::default()
    });

    let post = RequestInfo::new("POST", "https", "example.com", "/form");
    assert!(matches!(
        harness.begin(&post),
        PageOutcome::Bypass(BypassReason::Method)
    ));

    let member = get("/").with_cookie("logged_in_42", "token");
    assert!(matches!(
        harness.begin(&member),
        PageOutcome::Bypass(BypassReason::Cookie)
    ));

    let disabled = Harness::new(PageCacheConfig {
        enabled: false,
        ..Default::default()
    });
    assert!(matches!(
        disabled.begin(&get("/")),
        PageOutcome::Bypass(BypassReason::Disabled)
    ));
}

#[test]
fn analytics_cookies_share_the_anonymous_snapshot() {
    let harness = Harness::unsampled();
    let session = expect_capture(harness.begin(&get("/")));
    assert!(harness.finish(session, &html(), b"home"));

    let tracked = get("/").with_cookie_header("_ga=GA1.1.1; _gid=GA1.2.2");
    let replayed = expect_replay(harness.begin(&tracked));
    assert_eq!(replayed.body, Bytes::from_static(b"home"));
}

#[test]
fn unavailable_backend_still_serves_requests() {
    let harness = Harness::unsampled();
    harness.backend.set_available(false);

    let mut cache = harness.adapter();
    assert!(!cache.is_connected());
    let session = expect_capture(harness.page_cache.begin(&mut cache, &get("/"), &HeaderBag::new()));
    let outcome =
        session.on_output_ready(&mut cache, &html(), Bytes::from_static(b"rendered anyway"));
    assert_eq!(outcome.body, Bytes::from_static(b"rendered anyway"));

    harness.backend.set_available(true);
    assert!(harness.backend.is_empty());
}
