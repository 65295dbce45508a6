//! Beacon reporter: one configuration-driven entry point for logging,
//! metrics export, and error reporting.
//!
//! The façade builds whichever sub-reporters are configured and drives
//! them through a shared `new`/`start`/`stop` lifecycle:
//!
//! ```no_run
//! # async fn run() -> Result<(), beacon_reporter::ReporterError> {
//! let config: beacon_reporter::Config = Default::default();
//! let mut reporter = beacon_reporter::Reporter::new(config)?;
//! reporter.start().await?;
//!
//! reporter.counter("api.requests")?.inc(1);
//! reporter.timer("api.latency")?.time(|| { /* handle a request */ });
//!
//! reporter.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The metrics subsystem is the substantial part: a shared registry of
//! counters, gauges, histograms, meters, timers, and healthchecks, with
//! exporter backends (expvar HTTP, file, collectd UDP, Prometheus pull
//! and push-gateway) running as supervised background loops. Logging and
//! error reporting are thin collaborators over `tracing` — see the
//! [`logging`] and [`errors`] modules.

pub mod config;
mod error;
pub mod errors;
pub mod logging;
pub mod metrics;

use std::collections::HashMap;

use tracing::debug;

pub use config::{Config, ConfigError};
pub use error::ReporterError;
pub use errors::{ErrorReporter, ErrorSink, ErrorsConfig};
pub use logging::{LoggingConfig, LoggingReporter};
pub use metrics::config::MetricsConfig;
pub use metrics::metric::{
    Counter, Gauge, GaugeFloat64, Healthcheck, Histogram, Meter, Metric, MetricSnapshot, Timer,
};
pub use metrics::registry::Registry;
pub use metrics::sample::Sample;
pub use metrics::{MetricsError, MetricsReporter};

/// The reporting façade.
///
/// Absent configuration sections mean the corresponding sub-reporter is
/// never built; its accessors then return
/// [`ReporterError::MetricsNotConfigured`] (for metrics) or fall back to
/// plain `tracing` (for error captures).
pub struct Reporter {
    errors: Option<ErrorReporter>,
    logging: Option<LoggingReporter>,
    metrics: Option<MetricsReporter>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("errors", &self.errors.is_some())
            .field("logging", &self.logging.is_some())
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl Reporter {
    /// Validate the whole configuration and build the configured
    /// sub-reporters. Fails atomically: no resource is acquired here.
    pub fn new(config: Config) -> Result<Self, ReporterError> {
        let errors = config.errors.map(ErrorReporter::new);
        let logging = config.logging.map(LoggingReporter::new).transpose()?;
        let metrics = config.metrics.map(MetricsReporter::new).transpose()?;
        Ok(Self { errors, logging, metrics })
    }

    /// Start the sub-reporters: logging first so the others log through
    /// the configured pipeline, then metrics. A metrics failure rolls
    /// the logging pipeline back before returning.
    pub async fn start(&mut self) -> Result<(), ReporterError> {
        if let Some(logging) = &mut self.logging {
            logging.start()?;
        }
        if let Some(metrics) = &mut self.metrics {
            if let Err(error) = metrics.start().await {
                if let Some(logging) = &mut self.logging {
                    logging.stop();
                }
                return Err(error.into());
            }
        }
        debug!("reporter started");
        Ok(())
    }

    /// Stop the sub-reporters in reverse start order. Safe on a reporter
    /// that never started.
    pub async fn stop(&mut self) -> Result<(), ReporterError> {
        let outcome = match &mut self.metrics {
            Some(metrics) => metrics.stop().await.map_err(ReporterError::from),
            None => Ok(()),
        };
        // Logging stops last so the metrics shutdown is still logged.
        if let Some(logging) = &mut self.logging {
            logging.stop();
        }
        outcome
    }

    /// Capture an error with key/value tags. Without a configured errors
    /// section the capture is logged directly.
    pub fn capture(
        &self,
        error: &(dyn std::error::Error + 'static),
        tags: &HashMap<String, String>,
    ) {
        match &self.errors {
            Some(errors) => errors.capture(error, tags),
            None => tracing::error!(error = %error, tags = ?tags, "captured error"),
        }
    }

    // ========================================================================
    // Leveled logging helpers
    // ========================================================================

    pub fn debug(&self, message: &str, fields: &[(&str, &str)]) {
        tracing::debug!(context = ?fields, "{message}");
    }

    pub fn info(&self, message: &str, fields: &[(&str, &str)]) {
        tracing::info!(context = ?fields, "{message}");
    }

    pub fn warn(&self, message: &str, fields: &[(&str, &str)]) {
        tracing::warn!(context = ?fields, "{message}");
    }

    pub fn error(&self, message: &str, fields: &[(&str, &str)]) {
        tracing::error!(context = ?fields, "{message}");
    }

    /// Push the current metric snapshots to the configured push gateway.
    pub async fn push(&self) -> Result<(), ReporterError> {
        Ok(self.metrics()?.push().await?)
    }

    pub fn metrics(&self) -> Result<&MetricsReporter, ReporterError> {
        self.metrics.as_ref().ok_or(ReporterError::MetricsNotConfigured)
    }

    // ========================================================================
    // Metric accessors
    // ========================================================================

    pub fn counter(&self, name: &str) -> Result<Counter, ReporterError> {
        Ok(self.metrics()?.counter(name)?)
    }

    pub fn gauge(&self, name: &str) -> Result<Gauge, ReporterError> {
        Ok(self.metrics()?.gauge(name)?)
    }

    pub fn gauge_f64(&self, name: &str) -> Result<GaugeFloat64, ReporterError> {
        Ok(self.metrics()?.gauge_f64(name)?)
    }

    pub fn histogram(&self, name: &str) -> Result<Histogram, ReporterError> {
        Ok(self.metrics()?.histogram(name)?)
    }

    pub fn meter(&self, name: &str) -> Result<Meter, ReporterError> {
        Ok(self.metrics()?.meter(name)?)
    }

    pub fn timer(&self, name: &str) -> Result<Timer, ReporterError> {
        Ok(self.metrics()?.timer(name)?)
    }

    pub fn healthcheck(
        &self,
        name: &str,
        check: impl Fn() -> Result<(), String> + Send + Sync + 'static,
    ) -> Result<Healthcheck, ReporterError> {
        Ok(self.metrics()?.healthcheck(name, check)?)
    }

    pub fn register(&self, name: &str, metric: Metric) -> Result<(), ReporterError> {
        Ok(self.metrics()?.register(name, metric)?)
    }
}
