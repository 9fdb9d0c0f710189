//! `tracing` subscriber setup for binaries.

use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` does not say otherwise.
pub const DEFAULT_DIRECTIVES: &str = "sshtunnel=debug,warn";

/// Install a formatting subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_DIRECTIVES`].
pub fn init() {
    init_with_default(DEFAULT_DIRECTIVES);
}

pub fn init_with_default(directives: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(directives))
        .try_init();
}

fn filter(directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
}
