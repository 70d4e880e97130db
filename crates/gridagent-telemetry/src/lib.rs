//! Logging and metrics for the GridAgent server.
//!
//! Logs are structured JSON lines (or pretty text for local runs) with one
//! span per agent session. Metrics live in a [`MetricsRegistry`] that the
//! server's metrics listener renders in Prometheus text format.
//!
//! ```ignore
//! use gridagent_telemetry::{LogFormat, Telemetry, TelemetryConfig};
//!
//! let telemetry = Telemetry::init(TelemetryConfig::new().with_log_format(LogFormat::Pretty))?;
//! let metrics = telemetry.shared_metrics();
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod prometheus;

pub use config::{LogFormat, TelemetryConfig};
pub use logging::events;
pub use metrics::MetricsRegistry;
pub use prometheus::{ExpositionFormat, OPENMETRICS_CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE};

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber was already installed, or the filter was rejected.
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
}

/// Installed logging plus the process-wide metrics registry.
pub struct Telemetry {
    config: TelemetryConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Telemetry {
    /// Install the global subscriber described by `config`.
    ///
    /// Fails if a subscriber is already set, so call it once per process.
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        logging::init_logging(&config)?;
        Ok(Self::metrics_only(config))
    }

    /// Metrics registry without touching the global subscriber.
    pub fn metrics_only(config: TelemetryConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Handle to the registry for sessions, the bridge and the metrics listener.
    pub fn shared_metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }
}
