//! Structured logging initialization
//!
//! Every aperture process logs JSON lines through `tracing-subscriber`. The
//! filter comes from `RUST_LOG` when set, otherwise from
//! [`TelemetryConfig::default_filter`].

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter directives when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,aperture=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Filter directives did not parse
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every event as `service`
    pub service_name: String,
    /// Emit JSON lines (`false` gives human-readable output)
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "aperture".to_string(),
            json: true,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Install the global tracing subscriber
///
/// # Example
///
/// ```ignore
/// use aperture_common::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig::default())?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.default_filter)
            .map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?,
    };

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })?;

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_logs_json() {
        let config = TelemetryConfig::default();
        assert!(config.json);
        assert_eq!(config.service_name, "aperture");
        assert!(EnvFilter::try_new(&config.default_filter).is_ok());
    }
}
