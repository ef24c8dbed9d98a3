//! Telemetry
//!
//! Structured logging and lightweight metric recording.

mod logging;
mod metrics;

pub use logging::init_logging;
pub use metrics::{record_counter, set_gauge, CounterMetric, GaugeMetric};

use crate::config::TelemetryConfig;

/// Initialize all telemetry subsystems
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    init_logging(&config.log_level)
}
