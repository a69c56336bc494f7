use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Install the process-wide subscriber. `RUST_LOG` selects the filter
/// (default `info`); `EVA_LOG_ROLL=1` adds a rolling file writer.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter));

    if std::env::var("EVA_LOG_ROLL").ok().as_deref() != Some("1") {
        let _ = registry.try_init();
        return;
    }

    let dir = std::env::var("EVA_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let prefix = std::env::var("EVA_LOG_PREFIX").unwrap_or_else(|_| "eva".into());
    let rotation = std::env::var("EVA_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
    let dir_failed = std::fs::create_dir_all(&dir).is_err();
    let writer = match rotation.to_lowercase().as_str() {
        "hourly" => tracing_appender::rolling::hourly(&dir, &prefix),
        "minutely" => tracing_appender::rolling::minutely(&dir, &prefix),
        _ => tracing_appender::rolling::daily(&dir, &prefix),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(file_filter);
    let _ = registry.with(file_layer).try_init();
    if dir_failed {
        tracing::warn!(directory = %dir, "failed to create log directory");
    }
}
