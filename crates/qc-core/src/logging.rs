//! Logging setup
//!
//! `RUST_LOG` always wins over the configured level.

use crate::config::LogLevel;
use tracing_subscriber::EnvFilter;

fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()))
}

/// Install the global fmt subscriber
pub fn init(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_thread_names(true)
        .init();
}

/// Install the subscriber unless one is already set. Returns whether this call installed it.
pub fn try_init(level: LogLevel) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_test_writer()
        .try_init()
        .is_ok()
}
