//! Tracing setup for harnesses that embed a lock domain.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the process that owns `main` or to the test harness.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a fmt subscriber filtered by `RUST_LOG` that writes through the
/// test writer. Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init_test_tracing();
        init_test_tracing();
        tracing::debug!("tracing initialised");
    }
}
