//! Configuration for the metrics reporter and its exporters.
//!
//! The exporter list is a closed tagged union: each entry in the decoded
//! list is keyed by the backend name (`expvar`, `file`, `collectd`,
//! `prometheus`, `prompushgw`), matching the YAML shape
//!
//! ```yaml
//! exporters:
//!   - collectd:
//!       interval: 10
//!   - prometheus:
//!       listen: 127.0.0.1:9090
//!       interval: 5
//!       namespace: beacon
//!       subsystem: api
//! ```
//!
//! Validation runs once, before any exporter is constructed: malformed or
//! incomplete variants fail `Reporter::new`, never a flush tick.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::config::ConfigError;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_COLLECTD_CONNECT: &str = "127.0.0.1:25826";

/// Intervals are decoded from (fractional) seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("interval must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

mod opt_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        match secs {
            None => Ok(None),
            Some(secs) if secs.is_finite() && secs >= 0.0 => {
                Ok(Some(Duration::from_secs_f64(secs)))
            }
            Some(_) => Err(serde::de::Error::custom("interval must be a non-negative number")),
        }
    }
}

/// Top-level metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Configured exporter backends, in declaration order. Each entry is
    /// a single-key map; the key selects the backend.
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub exporters: Vec<ExporterConfig>,

    /// Interval between runtime-metric captures, in seconds.
    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,

    /// Capture process runtime metrics under the `process.` prefix.
    pub with_runtime_metrics: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            exporters: Vec::new(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            with_runtime_metrics: false,
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::MissingField {
                section: "metrics",
                field: "flush_interval",
            });
        }
        let mut push_gateways = 0;
        for exporter in &self.exporters {
            exporter.validate()?;
            if matches!(exporter, ExporterConfig::Prompushgw(_)) {
                push_gateways += 1;
            }
        }
        if push_gateways > 1 {
            return Err(ConfigError::DuplicatePushGateway);
        }
        Ok(())
    }
}

/// One configured exporter backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterConfig {
    Expvar(ExpvarConfig),
    File(FileConfig),
    Collectd(CollectdConfig),
    Prometheus(PrometheusConfig),
    Prompushgw(PushGatewayConfig),
}

impl ExporterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Expvar(c) => c.validate(),
            Self::File(c) => c.validate(),
            Self::Collectd(c) => c.validate(),
            Self::Prometheus(c) => c.validate(),
            Self::Prompushgw(c) => c.validate(),
        }
    }
}

/// Expvar exporter: serves the registry as JSON on demand, no flush loop.
#[derive(Debug, Clone, Deserialize)]
pub struct ExpvarConfig {
    pub listen: String,
}

impl ExpvarConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        parse_listen("expvar", &self.listen)?;
        Ok(())
    }

    pub(crate) fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen("expvar", &self.listen)
    }
}

/// File exporter: appends one JSON registry dump per tick.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub path: PathBuf,
    #[serde(default, with = "opt_duration_secs")]
    pub interval: Option<Duration>,
}

impl FileConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField { section: "file", field: "path" });
        }
        require_interval("file", self.interval)?;
        Ok(())
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval.unwrap_or(DEFAULT_FLUSH_INTERVAL)
    }
}

/// Collectd exporter: one UDP value-list datagram per metric per tick.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectdConfig {
    #[serde(default = "default_collectd_connect")]
    pub connect: String,
    #[serde(default, with = "opt_duration_secs")]
    pub interval: Option<Duration>,
    /// Glob patterns for metric names that must never be exported.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_collectd_connect() -> String {
    DEFAULT_COLLECTD_CONNECT.to_string()
}

impl CollectdConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        parse_listen("collectd", &self.connect)?;
        require_interval("collectd", self.interval)?;
        for pattern in &self.exclude {
            glob::Pattern::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub(crate) fn connect_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen("collectd", &self.connect)
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval.unwrap_or(DEFAULT_FLUSH_INTERVAL)
    }
}

/// Prometheus pull exporter: text exposition over HTTP, optionally mTLS.
#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusConfig {
    pub listen: String,
    #[serde(default, with = "opt_duration_secs")]
    pub interval: Option<Duration>,
    pub namespace: String,
    pub subsystem: String,
    #[serde(default)]
    pub certfile: Option<PathBuf>,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    #[serde(default)]
    pub cacertfile: Option<PathBuf>,
}

impl PrometheusConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        parse_listen("prometheus", &self.listen)?;
        if self.namespace.is_empty() {
            return Err(ConfigError::MissingField { section: "prometheus", field: "namespace" });
        }
        if self.subsystem.is_empty() {
            return Err(ConfigError::MissingField { section: "prometheus", field: "subsystem" });
        }
        require_interval("prometheus", self.interval)?;
        tls_trio("prometheus", &self.certfile, &self.keyfile, &self.cacertfile)?;
        Ok(())
    }

    pub(crate) fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_listen("prometheus", &self.listen)
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval.unwrap_or(DEFAULT_FLUSH_INTERVAL)
    }

    pub(crate) fn tls(&self) -> Option<TlsPaths> {
        tls_trio("prometheus", &self.certfile, &self.keyfile, &self.cacertfile)
            .ok()
            .flatten()
    }
}

/// Prometheus push-gateway exporter: caller-driven pushes, no loop.
#[derive(Debug, Clone, Deserialize)]
pub struct PushGatewayConfig {
    pub url: String,
    pub job: String,
    #[serde(default)]
    pub certfile: Option<PathBuf>,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    #[serde(default)]
    pub cacertfile: Option<PathBuf>,
}

impl PushGatewayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::MissingField { section: "prompushgw", field: "url" });
        }
        if self.job.is_empty() {
            return Err(ConfigError::MissingField { section: "prompushgw", field: "job" });
        }
        tls_trio("prompushgw", &self.certfile, &self.keyfile, &self.cacertfile)?;
        Ok(())
    }

    pub(crate) fn tls(&self) -> Option<TlsPaths> {
        tls_trio("prompushgw", &self.certfile, &self.keyfile, &self.cacertfile)
            .ok()
            .flatten()
    }
}

/// A complete client-certificate triple.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    pub cacertfile: PathBuf,
}

fn parse_listen(section: &'static str, value: &str) -> Result<SocketAddr, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::MissingField { section, field: "listen" });
    }
    value.parse().map_err(|_| ConfigError::InvalidAddress { section, value: value.to_string() })
}

fn require_interval(section: &'static str, interval: Option<Duration>) -> Result<(), ConfigError> {
    match interval {
        Some(interval) if !interval.is_zero() => Ok(()),
        _ => Err(ConfigError::MissingField { section, field: "interval" }),
    }
}

/// The cert/key/CA triple must be all-present or all-absent.
fn tls_trio(
    section: &'static str,
    certfile: &Option<PathBuf>,
    keyfile: &Option<PathBuf>,
    cacertfile: &Option<PathBuf>,
) -> Result<Option<TlsPaths>, ConfigError> {
    match (certfile, keyfile, cacertfile) {
        (None, None, None) => Ok(None),
        (Some(cert), Some(key), Some(ca)) => Ok(Some(TlsPaths {
            certfile: cert.clone(),
            keyfile: key.clone(),
            cacertfile: ca.clone(),
        })),
        _ => Err(ConfigError::PartialTls { section }),
    }
}
