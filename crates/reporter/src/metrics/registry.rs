//! In-process metric registry.
//!
//! Maps dot-separated names to metric handles. Get-or-create is atomic and
//! idempotent: asking for an existing name of the same kind returns the
//! existing handle, asking with a different kind is a hard error rather
//! than a silent coercion. A prefixed child view stores into its parent's
//! map, so exporters attached to the parent see child registrations too.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::metric::{
    Counter, Gauge, GaugeFloat64, Healthcheck, Histogram, Meter, Metric, MetricKind, Timer,
};
use super::sample::Sample;
use super::MetricsError;

const SEPARATOR: &str = ".";

/// Shared, thread-safe metric registry.
///
/// Clones are handles onto the same backing map. All operations are safe
/// for concurrent callers; `each` observes a snapshot of the entries held
/// at the time of the call.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    metrics: Arc<RwLock<HashMap<String, Metric>>>,
    prefix: Option<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// View of this registry that prepends `prefix.` to every name
    /// registered or looked up through it. Entries land in the parent's
    /// backing map; `each` on the child only visits the prefixed entries.
    pub fn child(&self, prefix: &str) -> Self {
        let prefix = match &self.prefix {
            Some(existing) => format!("{existing}{SEPARATOR}{prefix}"),
            None => prefix.to_string(),
        };
        Self { metrics: Arc::clone(&self.metrics), prefix: Some(prefix) }
    }

    fn full_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{SEPARATOR}{name}"),
            None => name.to_string(),
        }
    }

    /// Register a pre-built metric under `name`. Fails if the name is
    /// already taken.
    pub fn register(&self, name: &str, metric: Metric) -> Result<(), MetricsError> {
        let full = self.full_name(name);
        let mut metrics = self.metrics.write();
        if metrics.contains_key(&full) {
            return Err(MetricsError::DuplicateMetric { name: full });
        }
        metrics.insert(full, metric);
        Ok(())
    }

    /// Remove a metric by name. Unknown names are ignored.
    pub fn unregister(&self, name: &str) {
        self.metrics.write().remove(&self.full_name(name));
    }

    pub fn get(&self, name: &str) -> Option<Metric> {
        self.metrics.read().get(&self.full_name(name)).cloned()
    }

    /// Visit every (name, metric) pair currently registered.
    ///
    /// The visit runs on a snapshot taken under the read lock, so callers
    /// may register or update metrics concurrently; entries added during
    /// the iteration are not observed.
    pub fn each(&self, mut visit: impl FnMut(&str, &Metric)) {
        let entries: Vec<(String, Metric)> = {
            let metrics = self.metrics.read();
            match &self.prefix {
                Some(prefix) => {
                    let scope = format!("{prefix}{SEPARATOR}");
                    metrics
                        .iter()
                        .filter(|(name, _)| name.starts_with(&scope))
                        .map(|(name, metric)| (name.clone(), metric.clone()))
                        .collect()
                }
                None => metrics.iter().map(|(n, m)| (n.clone(), m.clone())).collect(),
            }
        };
        for (name, metric) in &entries {
            visit(name, metric);
        }
    }

    pub fn len(&self) -> usize {
        let mut n = 0;
        self.each(|_, _| n += 1);
        n
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_or_create(
        &self,
        name: &str,
        kind: MetricKind,
        build: impl FnOnce() -> Metric,
    ) -> Result<Metric, MetricsError> {
        let full = self.full_name(name);
        let mut metrics = self.metrics.write();
        let metric = metrics.entry(full.clone()).or_insert_with(build);
        if metric.kind() != kind {
            return Err(MetricsError::KindMismatch {
                name: full,
                registered: metric.kind(),
                requested: kind,
            });
        }
        Ok(metric.clone())
    }

    // ========================================================================
    // Typed accessors
    // ========================================================================

    pub fn counter(&self, name: &str) -> Result<Counter, MetricsError> {
        match self.get_or_create(name, MetricKind::Counter, || Metric::Counter(Counter::new()))? {
            Metric::Counter(m) => Ok(m),
            _ => unreachable!("kind checked by get_or_create"),
        }
    }

    pub fn gauge(&self, name: &str) -> Result<Gauge, MetricsError> {
        match self.get_or_create(name, MetricKind::Gauge, || Metric::Gauge(Gauge::new()))? {
            Metric::Gauge(m) => Ok(m),
            _ => unreachable!("kind checked by get_or_create"),
        }
    }

    pub fn gauge_f64(&self, name: &str) -> Result<GaugeFloat64, MetricsError> {
        match self.get_or_create(name, MetricKind::GaugeFloat64, || {
            Metric::GaugeFloat64(GaugeFloat64::new())
        })? {
            Metric::GaugeFloat64(m) => Ok(m),
            _ => unreachable!("kind checked by get_or_create"),
        }
    }

    /// Histogram over the default exponentially-decaying reservoir.
    pub fn histogram(&self, name: &str) -> Result<Histogram, MetricsError> {
        match self
            .get_or_create(name, MetricKind::Histogram, || Metric::Histogram(Histogram::new()))?
        {
            Metric::Histogram(m) => Ok(m),
            _ => unreachable!("kind checked by get_or_create"),
        }
    }

    /// Histogram over a caller-supplied reservoir. Only used when the
    /// metric does not exist yet; an existing histogram keeps its sample.
    pub fn histogram_with_sample(
        &self,
        name: &str,
        sample: Sample,
    ) -> Result<Histogram, MetricsError> {
        match self.get_or_create(name, MetricKind::Histogram, move || {
            Metric::Histogram(Histogram::with_sample(sample))
        })? {
            Metric::Histogram(m) => Ok(m),
            _ => unreachable!("kind checked by get_or_create"),
        }
    }

    pub fn meter(&self, name: &str) -> Result<Meter, MetricsError> {
        match self.get_or_create(name, MetricKind::Meter, || Metric::Meter(Meter::new()))? {
            Metric::Meter(m) => Ok(m),
            _ => unreachable!("kind checked by get_or_create"),
        }
    }

    pub fn timer(&self, name: &str) -> Result<Timer, MetricsError> {
        match self.get_or_create(name, MetricKind::Timer, || Metric::Timer(Timer::new()))? {
            Metric::Timer(m) => Ok(m),
            _ => unreachable!("kind checked by get_or_create"),
        }
    }

    pub fn timer_with_sample(&self, name: &str, sample: Sample) -> Result<Timer, MetricsError> {
        match self.get_or_create(name, MetricKind::Timer, move || {
            Metric::Timer(Timer::with_sample(sample))
        })? {
            Metric::Timer(m) => Ok(m),
            _ => unreachable!("kind checked by get_or_create"),
        }
    }

    /// Healthcheck running `check` on demand. An existing healthcheck of
    /// the same name keeps its original check function.
    pub fn healthcheck(
        &self,
        name: &str,
        check: impl Fn() -> Result<(), String> + Send + Sync + 'static,
    ) -> Result<Healthcheck, MetricsError> {
        match self.get_or_create(name, MetricKind::Healthcheck, move || {
            Metric::Healthcheck(Healthcheck::new(check))
        })? {
            Metric::Healthcheck(m) => Ok(m),
            _ => unreachable!("kind checked by get_or_create"),
        }
    }
}
