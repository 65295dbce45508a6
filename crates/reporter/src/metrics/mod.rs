//! Metrics subsystem.
//!
//! A shared [`Registry`] of named metrics, a set of exporter backends
//! delivering its snapshots to external systems, and a [`MetricsReporter`]
//! tying both to a supervised background-task lifecycle:
//!
//! - `new` validates configuration and builds every exporter (no I/O);
//! - `start` lets each exporter acquire its resources, then spawns the
//!   export loops under one [`TaskGroup`] — any failure tears the whole
//!   start back down;
//! - `stop` cancels the loops, waits for all of them, and surfaces the
//!   first loop error.
//!
//! Per-tick delivery failures (an unreachable collectd agent, a full
//! disk) are logged and counted by the exporters themselves; they never
//! terminate a loop.

pub mod config;
mod ewma;
pub mod exporters;
pub mod metric;
pub mod registry;
mod runtime;
pub mod sample;
pub mod supervisor;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ConfigError;

use config::{ExporterConfig, MetricsConfig};
use exporters::{
    CollectdExporter, Exporter, ExpvarExporter, FileExporter, PrometheusExporter, PushGateway,
};
use metric::{Counter, Gauge, GaugeFloat64, Healthcheck, Histogram, Meter, MetricKind, Timer};
use registry::Registry;
use sample::Sample;
use supervisor::TaskGroup;

pub use metric::{Metric, MetricSnapshot};

/// Errors from the metrics subsystem.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metric {name} is already registered")]
    DuplicateMetric { name: String },

    #[error("metric {name} is registered as {registered}, requested as {requested}")]
    KindMismatch { name: String, registered: MetricKind, requested: MetricKind },

    #[error("exporter loop {task} failed: {message}")]
    LoopFailed { task: &'static str, message: String },

    #[error("{context}: {source}")]
    Io { context: &'static str, source: std::io::Error },

    #[error("{context}: {source}")]
    Serialize { context: &'static str, source: serde_json::Error },

    #[error("{context}: {source}")]
    Tls { context: &'static str, source: rustls::Error },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),

    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error("push gateway rejected the batch with status {status}")]
    PushRejected { status: u16 },

    #[error("no push gateway is configured")]
    NoPushGateway,

    #[error("runtime metrics unavailable: {message}")]
    Runtime { message: String },

    #[error("metrics reporter is already started")]
    AlreadyStarted,

    #[error("metrics reporter is not started")]
    NotStarted,
}

/// Owns the registry, the configured exporters, and their background
/// loops.
pub struct MetricsReporter {
    config: MetricsConfig,
    registry: Registry,
    exporters: Vec<Box<dyn Exporter>>,
    push_gateway: Option<Arc<PushGateway>>,
    group: Option<TaskGroup>,
}

impl MetricsReporter {
    /// Validate the configuration and build every exporter. Performs no
    /// I/O; resources are acquired by [`start`](Self::start).
    pub fn new(config: MetricsConfig) -> Result<Self, MetricsError> {
        config.validate()?;
        let registry = Registry::new();
        let (exporters, push_gateway) = build_exporters(&config, &registry)?;
        Ok(Self { config, registry, exporters, push_gateway, group: None })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Acquire exporter resources and spawn the export loops.
    ///
    /// Ordering guarantees atomicity: every `init` completes before the
    /// first loop spawns, so an `init` failure needs no loop teardown,
    /// and a spawn failure shuts the group down before returning. Either
    /// way a failed `start` leaves the reporter stopped and restartable.
    pub async fn start(&mut self) -> Result<(), MetricsError> {
        if self.group.is_some() {
            return Err(MetricsError::AlreadyStarted);
        }

        let mut init_failure = None;
        for exporter in &mut self.exporters {
            if let Err(error) = exporter.init().await {
                warn!(exporter = exporter.name(), error = %error, "exporter init failed");
                init_failure = Some(error);
                break;
            }
        }
        if init_failure.is_none() {
            if let Some(gateway) = &self.push_gateway {
                if let Err(error) = gateway.init() {
                    init_failure = Some(error);
                }
            }
        }
        if let Some(error) = init_failure {
            // The init failure is the error worth reporting; a rebuild
            // failure on top of it is only logged.
            if let Err(rebuild_error) = self.reset_exporters() {
                warn!(error = %rebuild_error, "failed to rebuild exporters after failed init");
            }
            return Err(error);
        }

        let mut group = TaskGroup::new();
        let mut failure = None;
        for exporter in &mut self.exporters {
            if let Err(error) = exporter.run(&mut group) {
                warn!(exporter = exporter.name(), error = %error, "exporter spawn failed");
                failure = Some(error);
                break;
            }
        }
        if failure.is_none() && self.config.with_runtime_metrics {
            if let Err(error) =
                runtime::spawn(&mut group, self.registry.child("process"), self.config.flush_interval)
            {
                failure = Some(error);
            }
        }

        if let Some(error) = failure {
            // Loops that did spawn must not outlive the failed start.
            if let Err(shutdown_error) = group.shutdown().await {
                warn!(error = %shutdown_error, "teardown after failed start");
            }
            if let Err(rebuild_error) = self.reset_exporters() {
                warn!(error = %rebuild_error, "failed to rebuild exporters after failed start");
            }
            return Err(error);
        }

        if group.is_empty() {
            debug!("no exporter loops configured");
        } else {
            self.group = Some(group);
        }
        Ok(())
    }

    /// Cancel every export loop, wait for all of them, and return the
    /// first error any loop produced. Safe to call on a reporter that
    /// never started or already stopped.
    pub async fn stop(&mut self) -> Result<(), MetricsError> {
        match self.group.take() {
            Some(group) => group.shutdown().await,
            None => Ok(()),
        }
    }

    /// Push the current snapshots to the configured push gateway.
    pub async fn push(&self) -> Result<(), MetricsError> {
        match &self.push_gateway {
            Some(gateway) => gateway.push().await,
            None => Err(MetricsError::NoPushGateway),
        }
    }

    /// Drop half-initialized exporters and rebuild them from config, so a
    /// failed start releases every acquired socket and file handle.
    fn reset_exporters(&mut self) -> Result<(), MetricsError> {
        let (exporters, push_gateway) = build_exporters(&self.config, &self.registry)?;
        self.exporters = exporters;
        self.push_gateway = push_gateway;
        Ok(())
    }

    // ========================================================================
    // Registry delegation
    // ========================================================================

    pub fn counter(&self, name: &str) -> Result<Counter, MetricsError> {
        self.registry.counter(name)
    }

    pub fn gauge(&self, name: &str) -> Result<Gauge, MetricsError> {
        self.registry.gauge(name)
    }

    pub fn gauge_f64(&self, name: &str) -> Result<GaugeFloat64, MetricsError> {
        self.registry.gauge_f64(name)
    }

    pub fn histogram(&self, name: &str) -> Result<Histogram, MetricsError> {
        self.registry.histogram(name)
    }

    pub fn histogram_with_sample(&self, name: &str, sample: Sample) -> Result<Histogram, MetricsError> {
        self.registry.histogram_with_sample(name, sample)
    }

    pub fn meter(&self, name: &str) -> Result<Meter, MetricsError> {
        self.registry.meter(name)
    }

    pub fn timer(&self, name: &str) -> Result<Timer, MetricsError> {
        self.registry.timer(name)
    }

    pub fn timer_with_sample(&self, name: &str, sample: Sample) -> Result<Timer, MetricsError> {
        self.registry.timer_with_sample(name, sample)
    }

    pub fn healthcheck(
        &self,
        name: &str,
        check: impl Fn() -> Result<(), String> + Send + Sync + 'static,
    ) -> Result<Healthcheck, MetricsError> {
        self.registry.healthcheck(name, check)
    }

    pub fn register(&self, name: &str, metric: Metric) -> Result<(), MetricsError> {
        self.registry.register(name, metric)
    }

    pub fn unregister(&self, name: &str) {
        self.registry.unregister(name);
    }
}

fn build_exporters(
    config: &MetricsConfig,
    registry: &Registry,
) -> Result<(Vec<Box<dyn Exporter>>, Option<Arc<PushGateway>>), MetricsError> {
    let mut exporters: Vec<Box<dyn Exporter>> = Vec::new();
    let mut push_gateway = None;
    for exporter in &config.exporters {
        match exporter {
            ExporterConfig::Expvar(c) => {
                exporters.push(Box::new(ExpvarExporter::new(c.clone(), registry.clone())));
            }
            ExporterConfig::File(c) => {
                exporters.push(Box::new(FileExporter::new(c.clone(), registry.clone())));
            }
            ExporterConfig::Collectd(c) => {
                exporters.push(Box::new(CollectdExporter::new(c.clone(), registry.clone())?));
            }
            ExporterConfig::Prometheus(c) => {
                exporters.push(Box::new(PrometheusExporter::new(c.clone(), registry.clone())));
            }
            ExporterConfig::Prompushgw(c) => {
                // validate() guarantees at most one.
                push_gateway = Some(Arc::new(PushGateway::new(c.clone(), registry.clone())));
            }
        }
    }
    Ok((exporters, push_gateway))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_without_start_returns_promptly() {
        let mut reporter = MetricsReporter::new(MetricsConfig::default()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), reporter.stop())
            .await
            .expect("stop must not block")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_twice_is_an_error() {
        let config = MetricsConfig { with_runtime_metrics: true, ..MetricsConfig::default() };
        let mut reporter = MetricsReporter::new(config).unwrap();
        reporter.start().await.unwrap();
        let err = reporter.start().await.unwrap_err();
        assert!(matches!(err, MetricsError::AlreadyStarted));
        reporter.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_with_no_loops_leaves_reporter_stopped() {
        let mut reporter = MetricsReporter::new(MetricsConfig::default()).unwrap();
        reporter.start().await.unwrap();
        // No loops were configured, so a second start is still possible.
        reporter.start().await.unwrap();
        reporter.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_start_releases_resources() {
        use crate::metrics::config::{ExporterConfig, FileConfig};

        let config = MetricsConfig {
            exporters: vec![ExporterConfig::File(FileConfig {
                path: "/nonexistent-dir/metrics.log".into(),
                interval: Some(std::time::Duration::from_secs(1)),
            })],
            ..MetricsConfig::default()
        };
        let mut reporter = MetricsReporter::new(config).unwrap();
        // The surfaced error is the init failure itself.
        let err = reporter.start().await.unwrap_err();
        assert!(matches!(err, MetricsError::Io { context: "file exporter open", .. }));
        // The reporter is stopped and restartable after the failure.
        assert!(reporter.start().await.is_err());
        reporter.stop().await.unwrap();
    }

    #[test]
    fn push_without_gateway_is_an_error() {
        let reporter = MetricsReporter::new(MetricsConfig::default()).unwrap();
        let err = tokio_test::block_on(reporter.push()).unwrap_err();
        assert!(matches!(err, MetricsError::NoPushGateway));
    }

    #[test]
    fn accessors_share_the_registry() {
        let reporter = MetricsReporter::new(MetricsConfig::default()).unwrap();
        reporter.counter("requests").unwrap().inc(47);
        assert_eq!(reporter.registry().counter("requests").unwrap().count(), 47);
    }
}
