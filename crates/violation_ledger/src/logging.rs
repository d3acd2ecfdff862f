//! Diagnostic logging for the collector.
//!
//! Everything goes to stderr through `tracing`. `RUST_LOG` takes precedence;
//! otherwise the level follows the `-v` count: warnings by default, `info` at
//! one, `debug` (which includes every attributed violation) at two or more.

use tracing_subscriber::EnvFilter;

#[must_use]
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// Installs the global subscriber. Returns `false` if one was already set.
pub fn init_logging(verbosity: u8) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .is_ok()
}
