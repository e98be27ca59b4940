//! Tracing setup.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber: `RUST_LOG` controls filtering, with a
/// quiet default. Safe to call more than once (later calls are no-ops).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("citeloom=info,sqlx=warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
