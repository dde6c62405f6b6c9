//! Structured logging initialization via `tracing`.

/// Initialize the tracing subscriber with the configured format and
/// level.
///
/// Environment variables win over configuration: `RUST_LOG` first, then
/// `PALISADE_LOG_LEVEL`, then the configured `level`.
pub fn init_tracing_with(format: &str, level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if let Ok(level) = std::env::var("PALISADE_LOG_LEVEL") {
        EnvFilter::new(level)
    } else {
        EnvFilter::new(level.to_string())
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
