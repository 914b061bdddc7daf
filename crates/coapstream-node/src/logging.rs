//! Tracing subscriber configuration for transport nodes.
//!
//! Log levels follow these conventions:
//! - ERROR: Unrecoverable failures, listener setup errors
//! - WARN: Rejected peers, framing violations, malformed signals
//! - INFO: Channel lifecycle, session establishment
//! - DEBUG: Session state changes, handshake progress, closed streams
//! - TRACE: Wire-level data, raw frame bytes

use tracing_subscriber::EnvFilter;

/// The filter for a run: `RUST_LOG` when set, otherwise the configured level.
fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(default_level))
}

fn default_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_new(default_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the tracing subscriber.
///
/// `default_level` comes from the `[logging]` config section and applies
/// unless the `RUST_LOG` environment variable overrides it.
pub fn init(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(default_level))
        .init();
}

/// Initialize the tracing subscriber with JSON output.
///
/// Useful for structured logging in containerized environments.
pub fn init_json(default_level: &str) {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(default_level))
        .init();
}

/// Initialize the tracing subscriber for tests.
///
/// Uses `try_init` to avoid panicking if called multiple times.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_becomes_the_default_filter() {
        assert_eq!(default_filter("warn").to_string(), "warn");
        assert_eq!(default_filter("coapstream=trace").to_string(), "coapstream=trace");
    }

    #[test]
    fn unparseable_level_falls_back_to_info() {
        assert_eq!(default_filter("not=a=level").to_string(), "info");
    }
}
