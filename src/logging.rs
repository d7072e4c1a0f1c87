//! Tracing setup for the coordinator binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber. `RUST_LOG` controls the filter;
/// defaults to `info` for our crate and `warn` for everything else.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,paylock_server=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
