use std::{process, time::Duration};

use pagecache::{
    cache::{Backend, CacheAdapter, RedisBackend},
    config::{self, Command, FlushArgs, GetArgs, InvalidateArgs, Settings},
    infra::{error::InfraError, telemetry},
    page::PageCache,
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_error(&error);
        process::exit(1);
    }
}

fn report_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "command failed");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "command failed");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let command = cli_args.command.unwrap_or(Command::Ping);

    // Backend calls are synchronous with bounded timeouts.
    tokio::task::spawn_blocking(move || execute(command, &settings))
        .await
        .map_err(|err| InfraError::command(format!("command task failed: {err}")))?
}

fn execute(command: Command, settings: &Settings) -> Result<(), InfraError> {
    match command {
        Command::Ping => run_ping(settings),
        Command::Flush(args) => run_flush(settings, args),
        Command::Invalidate(args) => run_invalidate(settings, args),
        Command::Get(args) => run_get(settings, args),
    }
}

fn run_ping(settings: &Settings) -> Result<(), InfraError> {
    let backend = settings
        .cache
        .backend
        .as_ref()
        .ok_or_else(|| InfraError::command("no backend configured; set backend.url"))?;

    let mut connection = RedisBackend::connect(backend)?;
    connection.ping()?;
    info!(database = ?backend.database, "backend reachable");
    Ok(())
}

fn run_flush(settings: &Settings, args: FlushArgs) -> Result<(), InfraError> {
    let mut cache = connected_adapter(settings)?;
    if let Some(scope) = args.scope {
        cache.switch_scope(scope);
    }

    if !cache.flush(Duration::from_secs(args.delay_seconds)) {
        return Err(InfraError::command("flush failed; see the backend error above"));
    }
    info!(
        scope = cache.scope(),
        mode = ?settings.cache.flush_mode,
        "object cache flushed"
    );
    Ok(())
}

fn run_invalidate(settings: &Settings, args: InvalidateArgs) -> Result<(), InfraError> {
    let mut cache = connected_adapter(settings)?;
    let page_cache = PageCache::new(settings.page.clone());

    match page_cache.invalidate_url(&mut cache, &args.url) {
        Some(version) => {
            info!(url = %args.url, version, "page version bumped");
            Ok(())
        }
        None => Err(InfraError::command(format!(
            "failed to bump the version of {}",
            args.url
        ))),
    }
}

fn run_get(settings: &Settings, args: GetArgs) -> Result<(), InfraError> {
    let mut cache = connected_adapter(settings)?;
    let value = cache
        .get::<serde_json::Value>(&args.key, &args.group, true)
        .ok_or_else(|| {
            InfraError::command(format!("no value stored for `{}` in `{}`", args.key, args.group))
        })?;

    let rendered = serde_json::to_string_pretty(&value)
        .map_err(|err| InfraError::command(format!("failed to render value: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn connected_adapter(settings: &Settings) -> Result<CacheAdapter, InfraError> {
    if !settings.cache.has_backend() {
        return Err(InfraError::command("no backend configured; set backend.url"));
    }
    let cache = CacheAdapter::connect(&settings.cache);
    if !cache.is_connected() {
        return Err(InfraError::command("backend unreachable; see the error above"));
    }
    Ok(cache)
}
