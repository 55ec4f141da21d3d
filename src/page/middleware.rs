//! Page cache middleware for axum.
//!
//! Replays cached pages before the handler runs and captures eligible
//! responses after it. The object cache is synchronous, so each cache stage
//! runs on the blocking pool with its own adapter.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use tracing::{debug, instrument, warn};

use super::{CaptureSession, HeaderBag, PageCache, PageOutcome, ReplayResponse, RequestInfo};
use crate::cache::{BackendConnector, CacheAdapter, CacheConfig};

/// Header carrying the page cache outcome when `debug_header` is enabled.
pub const DEBUG_HEADER: &str = "x-page-cache";

/// Shared state for [`page_cache_layer`].
#[derive(Clone)]
pub struct PageCacheState {
    pub page_cache: Arc<PageCache>,
    pub cache_config: Arc<CacheConfig>,
    pub connector: Arc<dyn BackendConnector>,
}

impl PageCacheState {
    pub fn new(
        page_cache: PageCache,
        cache_config: CacheConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        Self {
            page_cache: Arc::new(page_cache),
            cache_config: Arc::new(cache_config),
            connector,
        }
    }

    fn open_adapter(&self) -> CacheAdapter {
        CacheAdapter::open(self.connector.as_ref(), &self.cache_config)
    }
}

/// Middleware serving and storing full pages.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(state): State<PageCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.page_cache.config().enabled {
        return next.run(request).await;
    }

    let info = RequestInfo::from_http(request.method(), request.uri(), request.headers());
    let lookup_state = state.clone();
    let lookup = tokio::task::spawn_blocking(move || {
        let mut cache = lookup_state.open_adapter();
        let outcome = lookup_state
            .page_cache
            .begin(&mut cache, &info, &HeaderBag::new());
        (cache, outcome)
    })
    .await;

    let (cache, outcome) = match lookup {
        Ok(lookup) => lookup,
        Err(err) => {
            warn!(error = %err, "page cache lookup task failed");
            return next.run(request).await;
        }
    };

    let debug_header = state.page_cache.config().debug_header;
    match outcome {
        PageOutcome::Replay(replayed) => {
            debug!(cache = "page", outcome = "hit", stale = replayed.stale, "serving snapshot");
            build_response(replayed, debug_header)
        }
        PageOutcome::Bypass(_) => {
            let mut response = next.run(request).await;
            if debug_header {
                mark(&mut response, "bypass");
            }
            response
        }
        PageOutcome::Capture(session) => capture(&state, cache, session, request, next).await,
    }
}

async fn capture(
    state: &PageCacheState,
    mut cache: CacheAdapter,
    mut session: CaptureSession,
    request: Request<Body>,
    next: Next,
) -> Response {
    debug!(cache = "page", outcome = "miss", "generating page");
    let response = next.run(request).await;
    let (mut parts, body) = response.into_parts();

    let limit = state.page_cache.config().max_body_bytes;
    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|length| length > limit) {
        debug!(limit, declared, "response too large to cache; streaming it through");
        release(session, cache).await;
        return generated(state, Response::from_parts(parts, body));
    }

    let bytes = match buffer_body(body, limit).await {
        Buffered::Complete(bytes) => bytes,
        Buffered::PassThrough(body) => {
            debug!(limit, "response not buffered; streaming it through");
            release(session, cache).await;
            return generated(state, Response::from_parts(parts, body));
        }
    };

    session.on_status_line(
        format!("{:?} {}", parts.version, parts.status),
        parts.status.as_u16(),
    );
    if parts.status.is_redirection()
        && let Some(location) = parts
            .headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
    {
        session.on_redirect(parts.status.as_u16(), location);
    }

    let sent = HeaderBag::from_header_map(&parts.headers);
    let fallback = bytes.clone();
    let finished =
        tokio::task::spawn_blocking(move || session.on_output_ready(&mut cache, &sent, bytes))
            .await;
    let outcome = match finished {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, "page capture task failed");
            return generated(state, Response::from_parts(parts, Body::from(fallback)));
        }
    };

    for (name, value) in outcome.headers.iter() {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(value))
            && !parts.headers.contains_key(&name)
        {
            parts.headers.insert(name, value);
        }
    }

    generated(state, Response::from_parts(parts, Body::from(outcome.body)))
}

fn generated(state: &PageCacheState, mut response: Response) -> Response {
    if state.page_cache.config().debug_header {
        mark(&mut response, "miss");
    }
    response
}

enum Buffered {
    Complete(Bytes),
    /// Over the limit or failed mid-stream: what was read, then the rest as it comes.
    PassThrough(Body),
}

async fn buffer_body(body: Body, limit: usize) -> Buffered {
    let mut chunks = body.into_data_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = chunks.next().await {
        let overflow = match chunk {
            Ok(chunk) => {
                buffer.extend_from_slice(&chunk);
                if buffer.len() <= limit {
                    continue;
                }
                None
            }
            Err(err) => {
                warn!(error = %err, "response body failed while buffering");
                Some(err)
            }
        };

        let head = stream::iter([Ok(buffer.freeze())]);
        let body = match overflow {
            None => Body::from_stream(head.chain(chunks)),
            Some(err) => Body::from_stream(head.chain(stream::iter([Err(err)]))),
        };
        return Buffered::PassThrough(body);
    }

    Buffered::Complete(buffer.freeze())
}

/// Give the generation lock back without touching the response.
async fn release(session: CaptureSession, mut cache: CacheAdapter) {
    if let Err(err) = tokio::task::spawn_blocking(move || session.abandon(&mut cache)).await {
        warn!(error = %err, "generation lock release task failed");
    }
}

fn build_response(replayed: ReplayResponse, debug_header: bool) -> Response {
    let mut builder = Response::builder().status(replayed.status);

    for (name, value) in replayed.headers.iter() {
        // The body length is known; hyper computes it.
        if name == header::CONTENT_LENGTH.as_str() {
            continue;
        }
        if let Ok(header_value) = HeaderValue::from_str(value) {
            builder = builder.header(name, header_value);
        }
    }
    if debug_header {
        builder = builder.header(DEBUG_HEADER, if replayed.stale { "stale" } else { "hit" });
    }

    builder
        .body(Body::from(replayed.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn mark(response: &mut Response, outcome: &'static str) {
    response
        .headers_mut()
        .insert(DEBUG_HEADER, HeaderValue::from_static(outcome));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::ReplayKind;

    fn replayed(stale: bool) -> ReplayResponse {
        let headers: HeaderBag = [("content-type", "text/html"), ("content-length", "999")]
            .into_iter()
            .collect();
        ReplayResponse {
            kind: ReplayKind::Full,
            status: 200,
            status_line: None,
            headers,
            body: Bytes::from_static(b"cached"),
            stale,
        }
    }

    #[test]
    fn replayed_response_drops_stored_content_length() {
        let response = build_response(replayed(false), false);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/html"))
        );
        assert!(response.headers().get(DEBUG_HEADER).is_none());
    }

    #[test]
    fn debug_header_marks_stale_replays() {
        let response = build_response(replayed(true), true);
        assert_eq!(
            response.headers().get(DEBUG_HEADER),
            Some(&HeaderValue::from_static("stale"))
        );
    }

    #[tokio::test]
    async fn body_within_limit_is_buffered() {
        match buffer_body(Body::from("small"), 16).await {
            Buffered::Complete(bytes) => assert_eq!(bytes, Bytes::from_static(b"small")),
            Buffered::PassThrough(_) => panic!("body under the limit should be buffered"),
        }
    }

    #[tokio::test]
    async fn oversized_body_is_passed_through_whole() {
        let chunks: Vec<Result<Bytes, axum::Error>> = vec![
            Ok(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"abcdefghij")),
            Ok(Bytes::from_static(b"KLMNOPQRST")),
        ];
        let body = Body::from_stream(stream::iter(chunks));

        let Buffered::PassThrough(body) = buffer_body(body, 15).await else {
            panic!("body over the limit should pass through");
        };
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .expect("pass-through body");
        assert_eq!(bytes, Bytes::from_static(b"0123456789abcdefghijKLMNOPQRST"));
    }
}
