//! Shared `tracing` initialization for every binary in this crate.
//!
//! Replaces the original's hand-rolled `write_file(DAEMON_LOG, ...)` calls
//! sprinkled through `daemon.py`/`daemon_front.py`/`runner.py` with one
//! `tracing-subscriber` setup, honoring `RUST_LOG` the way the rest of the
//! ecosystem does.

use tracing_subscriber::EnvFilter;

/// Initializes a line-oriented subscriber writing to stderr, defaulting to
/// `info` when `RUST_LOG` is unset. Safe to call more than once per
/// process (e.g. in tests); later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
