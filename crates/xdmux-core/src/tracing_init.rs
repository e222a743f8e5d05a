//! Tracing/logging initialization.
//!
//! Front ends embedding the proxy call [`init_tracing`] once at startup;
//! library code only ever logs through `tracing` macros.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the default filter directive for a configured log level.
///
/// The level applies to both proxy crates; everything else stays at `warn`.
pub fn default_filter(log_level: &str) -> String {
    format!("warn,xdmux_core={log_level},xdmux_proxy={log_level}")
}

/// Initialise the global tracing subscriber.
///
/// * `log_level` -- level used when `RUST_LOG` is not set (e.g. `"info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(log_level: &str, log_json: bool) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(log_level)),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .is_ok()
    }
}
