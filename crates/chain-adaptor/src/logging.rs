use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::AdaptorError;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter` (usually the configured
/// `log_level`). Fails if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) -> Result<(), AdaptorError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| AdaptorError::Logging(format!("invalid filter {default_filter:?}: {e}")))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| AdaptorError::Logging(e.to_string()))
}
