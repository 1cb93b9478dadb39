//! Diagnostics go to stderr through `tracing`; stdout stays reserved for the
//! role's own narrative, which Sales redirects into the log files.

use std::io;

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber. `RUST_LOG` overrides the `info` default.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Ignore error if already set (tests install one per binary).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Span tagging every diagnostic of this process with its role.
pub fn role_span(role: &str, id: Option<u32>) -> Span {
    match id {
        Some(id) => tracing::info_span!("process", role, id),
        None => tracing::info_span!("process", role),
    }
}
