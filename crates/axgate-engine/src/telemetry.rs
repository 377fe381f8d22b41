//! Tracing setup shared by every axgate binary.
//!
//! [`init_tracing`] installs the global subscriber. It can only be
//! installed once per process, so repeat calls are ignored.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `verbose` raises the default level from INFO to DEBUG; `RUST_LOG`
/// overrides it entirely when set. `json` emits newline-delimited JSON
/// lines for log shippers instead of human-readable output.
pub fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_str()));

    let base = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer().with_target(false);
    if json {
        base.with(layer.json()).try_init().ok();
    } else {
        base.with(layer).try_init().ok();
    }
}
