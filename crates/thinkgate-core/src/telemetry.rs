use tracing_subscriber::EnvFilter;

/// Output format for the global tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line; the default for the server.
    #[default]
    Json,
    /// Human-readable, for interactive CLI commands.
    Pretty,
}

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to `default_filter`.
/// Calling this twice is harmless: the second install is ignored.
pub fn init_tracing(format: LogFormat, default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.with_target(false).try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
