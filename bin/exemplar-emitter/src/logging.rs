use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Initializes operator logging.
///
/// Operator logs always go to standard error, leaving standard output to the correlated log records. The level
/// filtering directives are read from `EMITTER_LOG_LEVEL`, defaulting to `INFO`. When `EMITTER_LOG_FORMAT_JSON` is
/// `true` or `1`, logs are formatted as JSON, and otherwise in a compact, human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let is_json = std::env::var("EMITTER_LOG_FORMAT_JSON")
        .map(|s| s.trim().to_lowercase())
        .map(|s| s == "true" || s == "1")
        .unwrap_or(false);

    let level_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("EMITTER_LOG_LEVEL")
        .from_env_lossy();

    if is_json {
        tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(level_filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(level_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .try_init()
    }
}
