//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. Returns `false`
/// when a subscriber was already installed (tests, embedding applications).
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
