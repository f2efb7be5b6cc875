//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: JSON/pretty logging with sensitive data redaction
//! - **Metrics**: counters and histograms through the `metrics` facade with an
//!   optional Prometheus exporter

pub mod logging;
pub mod metrics;

pub use self::logging::{
    init_logging, LogFormat, LoggingConfig, RedactionConfig, RedactionPattern,
    SensitiveFieldRedactor,
};
pub use self::metrics::{init_metrics, MetricsConfig};
