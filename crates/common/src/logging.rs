//! Structured logging setup shared by the CLI and any embedder of the
//! gateway. Mirrors the teacher's `init_telemetry`: an env-filter driven
//! level plus a choice of human-readable or JSON formatting.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// `log_level` is used only when `RUST_LOG` is unset. `json` selects a
/// machine-readable formatter suitable for log aggregation; otherwise a
/// compact human-readable formatter is installed.
pub fn init_tracing(log_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}
