//! Tracing subscriber setup
//!
//! `RUST_LOG` wins when set; otherwise `default_directive` applies. Logs go
//! to stderr so the operator binary can print JSON on stdout.

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. Later calls are no-ops.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
