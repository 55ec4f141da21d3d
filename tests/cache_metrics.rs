use std::collections::HashSet;

use bytes::Bytes;
use metrics_util::debugging::DebuggingRecorder;
use pagecache::cache::{CacheAdapter, CacheConfig, MemoryBackend};
use pagecache::infra::telemetry::describe_metrics;
use pagecache::page::{HeaderBag, PageCache, PageCacheConfig, PageOutcome, RequestInfo};

#[test]
fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    describe_metrics();

    // Object cache hit/miss plus a backend failure.
    let backend = MemoryBackend::new();
    let mut cache = CacheAdapter::with_backend(Box::new(backend.clone()), &CacheConfig::default());
    assert!(cache.set("k", &1, "default", 0));
    assert_eq!(cache.get::<i64>("k", "default", false), Some(1));
    assert_eq!(cache.get::<i64>("absent", "default", false), None);
    backend.set_available(false);
    assert!(!cache.set("other", &2, "default", 0));
    backend.set_available(true);

    // Page cache: generate, store, replay and bypass.
    let page_cache = PageCache::new(PageCacheConfig {
        sample_window_seconds: 0,
        ..Default::default()
    });
    let request = RequestInfo::new("GET", "https", "example.com", "/metrics");
    let open = || CacheAdapter::open(&backend, &CacheConfig::default());

    let session = match page_cache.begin(&mut open(), &request, &HeaderBag::new()) {
        PageOutcome::Capture(session) => session,
        other => panic!("expected capture, got {other:?}"),
    };
    let stored = session.on_output_ready(
        &mut open(),
        &HeaderBag::new(),
        Bytes::from_static(b"<p>metrics</p>"),
    );
    assert!(stored.stored);

    assert!(matches!(
        page_cache.begin(&mut open(), &request, &HeaderBag::new()),
        PageOutcome::Replay(_)
    ));
    let post = RequestInfo::new("POST", "https", "example.com", "/metrics");
    assert!(matches!(
        page_cache.begin(&mut open(), &post, &HeaderBag::new()),
        PageOutcome::Bypass(_)
    ));

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "pagecache_object_hit_total",
        "pagecache_object_miss_total",
        "pagecache_backend_failure_total",
        "pagecache_page_outcome_total",
        "pagecache_generation_ms",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let outcomes: HashSet<String> = snapshot
        .iter()
        .filter(|(composite_key, _, _, _)| {
            composite_key.key().name() == "pagecache_page_outcome_total"
        })
        .flat_map(|(composite_key, _, _, _)| {
            composite_key
                .key()
                .labels()
                .filter(|label| label.key() == "outcome")
                .map(|label| label.value().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    for outcome in ["miss", "stored", "hit", "bypass"] {
        assert!(outcomes.contains(outcome), "missing outcome: {outcome}");
    }
}
