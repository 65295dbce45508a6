//! Crate-level error type.

use crate::config::ConfigError;
use crate::metrics::MetricsError;

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("metrics are not configured")]
    MetricsNotConfigured,
}
