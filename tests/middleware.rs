use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http_body_util::BodyExt;
use pagecache::cache::{CacheConfig, MemoryBackend};
use pagecache::page::{DEBUG_HEADER, PageCache, PageCacheConfig, PageCacheState, page_cache_layer};
use tower::ServiceExt;

const LARGE_PAGE: &str = "<main>this page is far longer than the configured limit</main>";

fn page_config() -> PageCacheConfig {
    PageCacheConfig {
        sample_window_seconds: 0,
        debug_header: true,
        ..Default::default()
    }
}

fn app(backend: &MemoryBackend, config: PageCacheConfig, calls: Arc<AtomicUsize>) -> Router {
    let state = PageCacheState::new(
        PageCache::new(config),
        CacheConfig::default(),
        Arc::new(backend.clone()),
    );

    let page_calls = Arc::clone(&calls);
    let tagged_calls = Arc::clone(&calls);
    let cookie_calls = Arc::clone(&calls);
    let broken_calls = Arc::clone(&calls);
    let large_calls = Arc::clone(&calls);
    let form_calls = calls;

    Router::new()
        .route(
            "/page",
            get(move || {
                let calls = Arc::clone(&page_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([(header::CONTENT_TYPE, "text/html")], "<p>hello</p>")
                }
            }),
        )
        .route(
            "/tagged",
            get(move || {
                let calls = Arc::clone(&tagged_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([(header::ETAG, "\"v1\"")], "tagged")
                }
            }),
        )
        .route(
            "/cookie",
            get(move || {
                let calls = Arc::clone(&cookie_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ([(header::SET_COOKIE, "session=abc")], "personal")
                }
            }),
        )
        .route(
            "/broken",
            get(move || {
                let calls = Arc::clone(&broken_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::SERVICE_UNAVAILABLE, "down")
                }
            }),
        )
        .route(
            "/large",
            get(move || {
                let calls = Arc::clone(&large_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    LARGE_PAGE
                }
            }),
        )
        .route(
            "/form",
            post(move || {
                let calls = Arc::clone(&form_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "posted".into_response()
                }
            }),
        )
        .layer(middleware::from_fn_with_state(state, page_cache_layer))
}

fn request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::HOST, "example.com")
        .body(Body::empty())
        .expect("request should build")
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

async fn body_text(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

fn outcome(response: &Response) -> Option<&HeaderValue> {
    response.headers().get(DEBUG_HEADER)
}

#[tokio::test]
async fn second_request_is_served_from_the_page_cache() {
    let backend = MemoryBackend::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(&backend, page_config(), Arc::clone(&calls));

    let first = send(&app, request(Method::GET, "/page")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(outcome(&first), Some(&HeaderValue::from_static("miss")));
    assert!(first.headers().contains_key(header::LAST_MODIFIED));
    assert_eq!(
        first.headers().get(header::CACHE_CONTROL),
        Some(&HeaderValue::from_static("max-age=600, must-revalidate"))
    );
    assert_eq!(body_text(first).await, "<p>hello</p>");

    let second = send(&app, request(Method::GET, "/page")).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(outcome(&second), Some(&HeaderValue::from_static("hit")));
    assert_eq!(
        second.headers().get(header::CONTENT_TYPE),
        Some(&HeaderValue::from_static("text/html"))
    );
    assert_eq!(body_text(second).await, "<p>hello</p>");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn matching_etag_gets_not_modified() {
    let backend = MemoryBackend::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(&backend, page_config(), Arc::clone(&calls));

    let first = send(&app, request(Method::GET, "/tagged")).await;
    assert_eq!(first.status(), StatusCode::OK);

    let mut conditional = request(Method::GET, "/tagged");
    conditional
        .headers_mut()
        .insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"v1\""));
    let second = send(&app, conditional).await;
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert!(body_text(second).await.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn responses_setting_cookies_are_never_cached() {
    let backend = MemoryBackend::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(&backend, page_config(), Arc::clone(&calls));

    for _ in 0..2 {
        let response = send(&app, request(Method::GET, "/cookie")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::SET_COOKIE));
        assert!(!response.headers().contains_key(header::LAST_MODIFIED));
        assert_eq!(body_text(response).await, "personal");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn server_errors_are_passed_through_uncached() {
    let backend = MemoryBackend::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(&backend, page_config(), Arc::clone(&calls));

    for _ in 0..2 {
        let response = send(&app, request(Method::GET, "/broken")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, "down");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn post_requests_bypass_the_cache() {
    let backend = MemoryBackend::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(&backend, page_config(), Arc::clone(&calls));

    let response = send(&app, request(Method::POST, "/form")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(outcome(&response), Some(&HeaderValue::from_static("bypass")));
    assert_eq!(body_text(response).await, "posted");
    assert!(backend.is_empty());
}

#[tokio::test]
async fn unavailable_backend_never_breaks_responses() {
    let backend = MemoryBackend::new();
    backend.set_available(false);
    let calls = Arc::new(AtomicUsize::new(0));
    let app = app(&backend, page_config(), Arc::clone(&calls));

    for _ in 0..2 {
        let response = send(&app, request(Method::GET, "/page")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "<p>hello</p>");
    }
    // Each request gets a fresh local-only adapter, so nothing is shared.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabled_page_cache_is_transparent() {
    let backend = MemoryBackend::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = PageCacheConfig {
        enabled: false,
        ..page_config()
    };
    let app = app(&backend, config, Arc::clone(&calls));

    for _ in 0..2 {
        let response = send(&app, request(Method::GET, "/page")).await;
        assert!(outcome(&response).is_none());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn oversized_pages_are_served_and_not_cached() {
    let backend = MemoryBackend::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let config = PageCacheConfig {
        max_body_bytes: 16,
        ..page_config()
    };
    let app = app(&backend, config, Arc::clone(&calls));

    for _ in 0..2 {
        let response = send(&app, request(Method::GET, "/large")).await;
        assert_eq!(response.status(), StatusCode::OK);
        // The lock was released, so the next request generates again.
        assert_eq!(outcome(&response), Some(&HeaderValue::from_static("miss")));
        assert_eq!(body_text(response).await, LARGE_PAGE);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(backend.is_empty());
}
