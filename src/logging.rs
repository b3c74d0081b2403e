//! Diagnostics on stderr via `RUST_LOG`.
//!
//! Run artifacts (screenshots, step and PDP records) are written by
//! [`crate::output`] and do not depend on the log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "pdp_cua=info,warn";

/// Install the stderr subscriber. Defaults to `pdp_cua=info,warn` if `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=pdp_cua=debug pdp-cua explore https://shop.test/
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
