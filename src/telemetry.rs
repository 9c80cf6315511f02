use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::error::{KeepsakeError, Result};

/// Installs a formatting subscriber filtered by `filter` (for example
/// `"info"` or `"keepsake=debug"`). `RUST_LOG` wins when it is set. Calling
/// this again once a subscriber is installed does nothing.
pub fn init(filter: &str) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(filter)
            .map_err(|e| KeepsakeError::Config(format!("log filter '{}': {}", filter, e)))?,
    };
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).try_init() {
        debug!(error = %e, "subscriber not installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        assert!(init("debug").is_ok());
        // the second subscriber is refused, which is logged, not returned
        assert!(init("info").is_ok());
    }

    #[test]
    fn malformed_filters_are_config_errors() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(init("keepsake=loudest"), Err(KeepsakeError::Config(_))));
        }
    }
}
