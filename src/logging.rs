// src/logging.rs
//
// Process-wide `tracing` subscriber for the binary.
//
// THERMO_PILOT_LOG takes an EnvFilter directive string
// (e.g. "info,thermo_pilot::live=debug"); the default is "info".

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "THERMO_PILOT_LOG";

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init();
}
