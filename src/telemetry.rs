//! Tracing initialization.
//!
//! Structured logs go through `tracing` with an `EnvFilter`, so `RUST_LOG`
//! controls verbosity per target. Metric exposition lives in
//! [`crate::metrics`]; exporter pipelines (OTLP and friends) are external
//! collaborators and attach their own layers out of process.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops, which keeps test binaries happy.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
