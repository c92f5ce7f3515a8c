use crate::config::GlobalConfig;
use crate::error::{DevServeError, Result};
use std::sync::Once;
use tracing::{debug, info};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*, registry::Registry};

static LOGGER_INIT: Once = Once::new();

/// File name of the session log inside the log directory.
pub const LOG_FILE_NAME: &str = "dev.log";

/// Initialize logging for a dev or build session.
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_logging(config: &GlobalConfig) -> Result<()> {
    let mut init_result = Ok(());

    LOGGER_INIT.call_once(|| {
        init_result = init_logging_internal(config);
    });

    init_result
}

fn init_logging_internal(config: &GlobalConfig) -> Result<()> {
    let log_level = config.logging.level.to_lowercase();

    let log_dir = if config.logging.file_enabled {
        let log_dir = config.get_log_dir();
        std::fs::create_dir_all(&log_dir).map_err(|e| {
            DevServeError::ConfigError(format!("Failed to create log directory: {e}"))
        })?;
        Some(log_dir)
    } else {
        None
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log_level))
        .map_err(|e| DevServeError::ConfigError(format!("Invalid log level '{log_level}': {e}")))?;

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .with_target(false);

    let registry = Registry::default().with(filter).with(stdout_layer);

    match &log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let file_layer = fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            registry.with(file_layer).init();
        }
        None => registry.init(),
    }

    debug!("Logging initialized with level: {}", log_level);
    if let Some(dir) = &log_dir {
        info!("Log file: {}", dir.join(LOG_FILE_NAME).display());
    }

    Ok(())
}

/// Log a structured message for build events
pub fn log_build_event(event: &str, details: &str) {
    info!(target: "build", event = event, details = details);
}
