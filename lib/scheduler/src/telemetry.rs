//! Tracing setup for agent processes.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "info,workweave=debug";

/// Installs the global subscriber: `RUST_LOG` if set, else `default_directive`.
///
/// Returns false if a subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt::layer())
        .try_init()
        .is_ok()
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        init_tracing(DEFAULT_DIRECTIVE);
        assert!(!init_tracing(DEFAULT_DIRECTIVE));
    }

    #[test]
    fn default_directive_parses() {
        let filter = EnvFilter::new(DEFAULT_DIRECTIVE);
        assert!(filter.to_string().contains("workweave=debug"));
    }
}
