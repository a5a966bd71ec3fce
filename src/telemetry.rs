//! Opt-in tracing setup for binaries and tests.
//!
//! The library itself only emits `tracing` events; embedding applications
//! normally install their own subscriber. This helper exists for demos and
//! integration tests that want the standard stderr layout.

use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "WATCHMAN_IPC_LOG";

/// Install a compact stderr subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity).into())
        .with_env_var(LOG_ENV_VAR)
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_env_filter(filter)
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}
