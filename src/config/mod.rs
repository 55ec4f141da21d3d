//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU64, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{BackendSettings, CacheConfig, FlushMode};
use crate::page::PageCacheConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pagecache";
const ENV_PREFIX: &str = "PAGECACHE";
const REDIS_SCHEMES: [&str; 4] = ["redis", "rediss", "redis+unix", "unix"];

/// Command-line arguments for the pagecache binary.
#[derive(Debug, Parser)]
#[command(
    name = "pagecache",
    version,
    about = "Object cache and full-page cache maintenance tool"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PAGECACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Check that the backend is reachable.
    Ping,
    /// Flush the object cache.
    Flush(FlushArgs),
    /// Bump the content version of a URL so every cached variant regenerates.
    Invalidate(InvalidateArgs),
    /// Print a cached value as JSON.
    Get(GetArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the backend connection URL.
    #[arg(long = "redis-url", value_name = "URL", global = true)]
    pub redis_url: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct FlushArgs {
    /// Seconds to wait before flushing.
    #[arg(long = "delay-seconds", default_value_t = 0)]
    pub delay_seconds: u64,

    /// Flush this scope instead of the configured one.
    #[arg(long, value_name = "ID")]
    pub scope: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    /// Absolute URL of the page, e.g. `https://example.com/about`.
    #[arg(value_name = "URL")]
    pub url: Url,
}

#[derive(Debug, Args, Clone)]
pub struct GetArgs {
    #[arg(value_name = "GROUP")]
    pub group: String,

    #[arg(value_name = "KEY")]
    pub key: String,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub page: PageCacheConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    backend: RawBackendSettings,
    cache: RawCacheSettings,
    page: RawPageSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(url) = overrides.redis_url.as_ref() {
            self.backend.url = Some(url.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            backend,
            cache,
            page,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let backend = build_backend_settings(backend)?;
        let cache = build_cache_config(cache, backend)?;
        let page = build_page_config(page)?;

        Ok(Self {
            logging,
            cache,
            page,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_backend_settings(
    backend: RawBackendSettings,
) -> Result<Option<BackendSettings>, LoadError> {
    let Some(url) = backend.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }) else {
        return Ok(None);
    };

    let parsed = Url::parse(&url)
        .map_err(|err| LoadError::invalid("backend.url", format!("failed to parse: {err}")))?;
    if !REDIS_SCHEMES.contains(&parsed.scheme()) {
        return Err(LoadError::invalid(
            "backend.url",
            format!("unsupported scheme `{}`", parsed.scheme()),
        ));
    }

    let mut settings = BackendSettings::new(url);
    if let Some(database) = backend.database {
        if database < 0 {
            return Err(LoadError::invalid("backend.database", "must not be negative"));
        }
        settings.database = Some(database);
    }
    settings.password = backend.password.filter(|password| !password.is_empty());
    if let Some(ms) = backend.connect_timeout_ms {
        settings.connect_timeout = millis(ms, "backend.connect_timeout_ms")?;
    }
    if let Some(ms) = backend.operation_timeout_ms {
        settings.operation_timeout = millis(ms, "backend.operation_timeout_ms")?;
    }
    Ok(Some(settings))
}

fn build_cache_config(
    cache: RawCacheSettings,
    backend: Option<BackendSettings>,
) -> Result<CacheConfig, LoadError> {
    let mut config = CacheConfig {
        backend,
        ..CacheConfig::default()
    };

    if let Some(prefix) = cache.key_prefix {
        config.key_prefix = prefix;
    }
    if let Some(scope) = cache.scope {
        config.scope = scope;
    }
    if let Some(groups) = cache.global_groups {
        config.global_groups = non_empty_names(groups);
    }
    if let Some(groups) = cache.ignored_groups {
        config.ignored_groups = non_empty_names(groups);
    }
    if let Some(mode) = cache.flush_mode {
        config.flush_mode = match mode.trim().to_ascii_lowercase().as_str() {
            "all" => FlushMode::All,
            "scope" => FlushMode::Scope,
            other => {
                return Err(LoadError::invalid(
                    "cache.flush_mode",
                    format!("expected `all` or `scope`, got `{other}`"),
                ));
            }
        };
    }
    Ok(config)
}

fn build_page_config(page: RawPageSettings) -> Result<PageCacheConfig, LoadError> {
    let defaults = PageCacheConfig::default();

    let group = match page.group {
        Some(group) if group.trim().is_empty() => {
            return Err(LoadError::invalid("page.group", "must not be empty"));
        }
        Some(group) => group.trim().to_string(),
        None => defaults.group,
    };
    let lock_ttl_seconds = match page.lock_ttl_seconds {
        Some(seconds) => non_zero(seconds, "page.lock_ttl_seconds")?.get(),
        None => defaults.lock_ttl_seconds,
    };
    let max_body_bytes = match page.max_body_bytes {
        Some(bytes) => usize::try_from(non_zero(bytes, "page.max_body_bytes")?.get())
            .map_err(|_| LoadError::invalid("page.max_body_bytes", "value exceeds usize"))?,
        None => defaults.max_body_bytes,
    };

    Ok(PageCacheConfig {
        enabled: page.enabled.unwrap_or(defaults.enabled),
        group,
        max_age_seconds: page.max_age_seconds.unwrap_or(defaults.max_age_seconds),
        sample_window_seconds: page
            .sample_window_seconds
            .unwrap_or(defaults.sample_window_seconds),
        sample_threshold: page.sample_threshold.unwrap_or(defaults.sample_threshold),
        lock_ttl_seconds,
        use_stale: page.use_stale.unwrap_or(defaults.use_stale),
        cache_redirects: page.cache_redirects.unwrap_or(defaults.cache_redirects),
        cache_control: page.cache_control.unwrap_or(defaults.cache_control),
        uncached_headers: page
            .uncached_headers
            .map(non_empty_names)
            .unwrap_or(defaults.uncached_headers),
        bypass_cookie_prefixes: page
            .bypass_cookie_prefixes
            .map(non_empty_names)
            .unwrap_or(defaults.bypass_cookie_prefixes),
        debug_header: page.debug_header.unwrap_or(defaults.debug_header),
        max_body_bytes,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    url: Option<String>,
    database: Option<i64>,
    password: Option<String>,
    connect_timeout_ms: Option<u64>,
    operation_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    key_prefix: Option<String>,
    scope: Option<u64>,
    global_groups: Option<Vec<String>>,
    ignored_groups: Option<Vec<String>>,
    flush_mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPageSettings {
    enabled: Option<bool>,
    group: Option<String>,
    max_age_seconds: Option<u64>,
    sample_window_seconds: Option<u64>,
    sample_threshold: Option<u32>,
    lock_ttl_seconds: Option<u64>,
    use_stale: Option<bool>,
    cache_redirects: Option<bool>,
    cache_control: Option<bool>,
    uncached_headers: Option<Vec<String>>,
    bypass_cookie_prefixes: Option<Vec<String>>,
    debug_header: Option<bool>,
    max_body_bytes: Option<u64>,
}

fn non_zero(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    non_zero(value, key).map(|ms| Duration::from_millis(ms.get()))
}

fn non_empty_names(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
