use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the caches emit.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pagecache_object_hit_total",
            Unit::Count,
            "Total number of object cache hits."
        );
        describe_counter!(
            "pagecache_object_miss_total",
            Unit::Count,
            "Total number of object cache misses."
        );
        describe_counter!(
            "pagecache_backend_failure_total",
            Unit::Count,
            "Total number of backend failures that degraded an adapter, labelled by operation."
        );
        describe_counter!(
            "pagecache_page_outcome_total",
            Unit::Count,
            "Total number of page cache outcomes (hit, stale, miss, bypass, stored, skip reasons)."
        );
        describe_histogram!(
            "pagecache_generation_ms",
            Unit::Milliseconds,
            "Page generation latency observed during capture in milliseconds."
        );
    });
}
