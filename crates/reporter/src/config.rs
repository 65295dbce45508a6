//! Top-level configuration.
//!
//! Every section is optional: an absent section means the corresponding
//! sub-reporter is not built at all.

use serde::Deserialize;

use crate::errors::ErrorsConfig;
use crate::logging::LoggingConfig;
use crate::metrics::config::MetricsConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Option<LoggingConfig>,
    pub errors: Option<ErrorsConfig>,
    pub metrics: Option<MetricsConfig>,
}

/// Configuration validation errors. All of these surface from
/// construction, before any resource is touched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{section}: missing or empty field {field}")]
    MissingField { section: &'static str, field: &'static str },

    #[error("{section}: invalid socket address {value:?}")]
    InvalidAddress { section: &'static str, value: String },

    #[error("{section}: certfile, keyfile and cacertfile must be set together")]
    PartialTls { section: &'static str },

    #[error("invalid exclusion pattern {pattern:?}: {source}")]
    InvalidPattern { pattern: String, source: glob::PatternError },

    #[error("at most one push gateway may be configured")]
    DuplicatePushGateway,

    #[error("invalid log level {value:?}: {message}")]
    InvalidLevel { value: String, message: String },
}
