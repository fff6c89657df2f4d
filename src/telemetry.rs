//! Tracing initialization.
//!
//! Log verbosity follows `LOG_LEVEL` (`debug|info|warn|error`); a `RUST_LOG`
//! filter expression takes precedence when set.

use tracing_subscriber::EnvFilter;

pub fn init(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
