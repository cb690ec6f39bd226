//! Tracing/logging initialization.
//!
//! The executor emits structured events (`job_id`, `lock_owner`, worker
//! names); this module wires them into JSON output filtered via `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    init_with(filter);
}

/// Initialize with an explicit filter directive, ignoring the environment.
///
/// Useful for embedding hosts that manage configuration themselves.
pub fn init_with_filter(directives: &str) {
    init_with(EnvFilter::new(directives));
}

fn init_with(filter: EnvFilter) {
    // JSON logs + timestamps; idempotent via try_init.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
