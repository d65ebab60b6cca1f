use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

/// Maps a configured level to a filter directive, falling back to `info` for
/// unrecognised values.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

/// Builds the process subscriber. `RUST_LOG` takes precedence when set;
/// otherwise `default_level` is used.
pub fn subscriber(default_level: &str) -> impl Subscriber + Send + Sync + 'static {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish()
}

/// Initialize tracing/logging for the process.
pub fn init(default_level: &str) {
    use tracing_subscriber::util::SubscriberInitExt;

    // try_init so tests can call this repeatedly
    let _ = subscriber(default_level).try_init();
}
