//! Logging bootstrap
//!
//! The library only emits `tracing` events. Hosts that have no subscriber
//! of their own can install a plain fmt subscriber here.
//!
//! Security decisions are logged on the `security_audit` target, so
//! `security_audit=info` keeps them visible under a quieter default.

use crate::error::{ProtocolError, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber
///
/// `filter` uses `EnvFilter` syntax, e.g. `"debug"` or
/// `"info,connect_link_core::network=debug"`; an invalid filter falls back
/// to `info`. Fails if a global subscriber is already installed.
pub fn init(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| ProtocolError::Other(format!("Failed to initialize logging: {}", e)))?;

    info!("connect-link-core {} logging at '{}'", crate::VERSION, filter);
    Ok(())
}

/// Like [`init`], reading the filter from `RUST_LOG`
pub fn init_from_env() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    init(&filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // Another test may have installed a subscriber first
        let _ = init("debug");
        assert!(init("not a [valid filter").is_err());
    }
}
