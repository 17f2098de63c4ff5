//! Tracing setup for binaries embedding Rallypoint.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already installed, in which
/// case nothing changes.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_second_call_is_noop() {
        init_tracing();
        assert!(!init_tracing());
    }
}
