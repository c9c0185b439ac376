//! Development-time tracing for debugging colony runs.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of colony product output.
//!
//! - **Product artifacts**: `.colony/progress.md` (`io/progress_log`) and the
//!   per-agent executor logs under `.colony/logs/`. Always written, unaffected
//!   by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `colony=info,warn` if unset so a
/// run shows its cycles and task transitions.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=colony=debug colony run --executor claude
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("colony=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
