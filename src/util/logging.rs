// log-enricher - util/logging.rs
//
// Structured logging, priority: RUST_LOG env var > LOG_LEVEL config key >
// default "info". Output is always stderr — this is a sidecar, stdout is
// reserved for nothing in particular but stderr keeps logs out of any
// future pipe consumer's way.

use tracing_subscriber::EnvFilter;

/// Initialise the logging subsystem.
///
/// `config_level` is the value of the `LOG_LEVEL` environment variable,
/// already read by `crate::config::Config`.
pub fn init(config_level: Option<&str>) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if let Some(level) = config_level {
        EnvFilter::new(level.to_lowercase())
    } else {
        EnvFilter::new(super::constants::DEFAULT_LOG_LEVEL)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .init();

    tracing::debug!(
        app = super::constants::APP_NAME,
        version = super::constants::APP_VERSION,
        "logging initialised"
    );
}
