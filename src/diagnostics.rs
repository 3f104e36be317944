//! Uniform failure text and the tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Prefix every user-facing failure the same way so they are easy to grep.
pub fn error_message(msg: impl AsRef<str>) -> String {
    format!("stack-bootstrap: {}", msg.as_ref())
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init();
}
