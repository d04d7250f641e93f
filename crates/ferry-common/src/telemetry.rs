//! Logging initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either a
//! JSON or a plain fmt layer. The engine itself only emits `tracing` events;
//! binaries embedding it call [`init_logging`] once at startup.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,ferry=debug,kube=info,hyper=warn";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber (usually: already set)
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    /// The configured filter directive did not parse
    #[error("invalid log filter {filter:?}: {message}")]
    InvalidFilter {
        /// The rejected directive
        filter: String,
        /// Parser message
        message: String,
    },
}

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Explicit filter directive; `RUST_LOG` and then [`DEFAULT_FILTER`] are
    /// used when unset
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: std::env::var("FERRY_LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(true),
            filter: None,
        }
    }
}

impl LoggingConfig {
    fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        match &self.filter {
            Some(directive) => {
                EnvFilter::try_new(directive).map_err(|e| TelemetryError::InvalidFilter {
                    filter: directive.clone(),
                    message: e.to_string(),
                })
            }
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
        }
    }
}

/// Install the global subscriber
///
/// # Example
///
/// ```ignore
/// use ferry_common::telemetry::{init_logging, LoggingConfig};
///
/// init_logging(LoggingConfig { json: false, ..Default::default() })?;
/// ```
pub fn init_logging(config: LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = config.env_filter()?;

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_filter_is_parsed() {
        let config = LoggingConfig {
            json: false,
            filter: Some("warn,ferry_plan=trace".to_string()),
        };
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = LoggingConfig {
            json: true,
            filter: Some("ferry=loud".to_string()),
        };
        match config.env_filter() {
            Err(TelemetryError::InvalidFilter { filter, .. }) => assert_eq!(filter, "ferry=loud"),
            other => panic!("expected InvalidFilter, got {other:?}"),
        }
    }

    #[test]
    fn test_second_init_reports_subscriber_error() {
        let config = LoggingConfig {
            json: false,
            filter: Some("error".to_string()),
        };
        // The first call may lose a race with another test's subscriber; the
        // second call must always fail.
        let _ = init_logging(config.clone());
        assert!(matches!(
            init_logging(config),
            Err(TelemetryError::SubscriberInit(_))
        ));
    }
}
