//! Tracing subscriber setup shared by Conduit binaries.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter directive for a crate, e.g. `conduit_agent=debug`.
pub fn default_filter(crate_name: &str, level: &str) -> String {
    format!("{}={level}", crate_name.replace('-', "_"))
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. With `log_json` every
/// event is written as one JSON object per line.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let json = log_json.then(|| fmt::layer().json());
    let plain = (!log_json).then(fmt::layer);
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();
}
