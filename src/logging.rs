//! Log output for binaries and tests built on this crate.
//!
//! The library only emits `tracing` events; nothing is printed until a
//! subscriber is installed. [`init`] installs a formatted stderr subscriber
//! filtered by `RUST_LOG`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Install the default subscriber, `RUST_LOG` or `info`.
///
/// Returns false if a global subscriber was already set.
pub fn init() -> bool {
    init_with_default("info")
}

/// Install the default subscriber with `directive` used when `RUST_LOG` is
/// unset or unparsable, e.g. `"bulkflow=debug,reqwest=warn"`.
///
/// Returns false if a global subscriber was already set.
pub fn init_with_default(directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        init_with_default("warn");
        assert!(!init());
    }
}
