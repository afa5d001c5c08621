//! Tracing setup for binaries built on Peril.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` (e.g.
/// `"info"` or `"peril=debug"`) is used. Returns `false` if a global
/// subscriber was already installed, which makes repeated calls from
/// tests harmless.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
