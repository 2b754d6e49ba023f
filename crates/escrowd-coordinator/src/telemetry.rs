//! Tracing bootstrap.
//!
//! The filter comes from `ESCROWD_LOG` when set (any `EnvFilter` directive,
//! e.g. `escrowd_coordinator=debug,info`), otherwise from
//! [`LogConfig::level`]. Escalation-worthy events carry `escalate = true`,
//! which JSON output exposes as a plain field for alert routing.

use escrowd_types::{EscrowError, LogConfig, Result, constants};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// # Errors
/// `Configuration` if the configured level is not a valid filter directive
/// or a global subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    installed.map_err(|e| EscrowError::Configuration(format!("telemetry: {e}")))
}

fn build_filter(config: &LogConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_env(constants::LOG_ENV_VAR) {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| EscrowError::Configuration(format!("log.level {:?}: {e}", config.level))),
    }
}
