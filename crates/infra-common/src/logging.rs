//! Logging setup for rnat binaries and tests.
//!
//! Thin wrapper over `tracing-subscriber` so every consumer configures the
//! same way: an `EnvFilter` seeded from `RUST_LOG` with a programmatic
//! default level underneath it.

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The default log level when `RUST_LOG` is not set.
    pub level: Level,
    /// Whether to include file and line information.
    pub file_info: bool,
    /// Whether to include thread ids (useful for the concurrency tests).
    pub thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            file_info: false,
            thread_ids: false,
        }
    }
}

impl LoggingConfig {
    /// Create a configuration with the given default level.
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    /// Enable file and line information in logs.
    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    /// Enable thread ids in logs.
    pub fn with_thread_ids(mut self) -> Self {
        self.thread_ids = true;
        self
    }
}

/// Initialize the global subscriber.
///
/// Safe to call more than once; later calls are no-ops (the first subscriber
/// wins). Tests rely on this when several of them race to initialize.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let _ = fmt()
        .with_env_filter(filter)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .with_thread_ids(config.thread_ids)
        .try_init();
}
