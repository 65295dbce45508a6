//! Metric kinds and their snapshots.
//!
//! Every kind is a cheap-to-clone handle around shared state, so two
//! `get_or_create` calls for the same name observe each other's updates.
//! Snapshots take one lock per metric: derived values (mean, percentiles,
//! rates) inside a single snapshot are mutually consistent even while
//! concurrent updates land between exporter ticks.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::ewma::{Ewma, TICK_INTERVAL_SECS};
use super::sample::{self, Sample};

/// Percentiles reported by histograms and timers.
pub const PERCENTILES: [f64; 6] = [0.5, 0.75, 0.95, 0.98, 0.99, 0.999];

/// Discriminator for the closed set of metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    GaugeFloat64,
    Histogram,
    Meter,
    Timer,
    Healthcheck,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::GaugeFloat64 => "gauge_f64",
            Self::Histogram => "histogram",
            Self::Meter => "meter",
            Self::Timer => "timer",
            Self::Healthcheck => "healthcheck",
        };
        write!(f, "{name}")
    }
}

/// A registered metric of any kind.
#[derive(Debug, Clone)]
pub enum Metric {
    Counter(Counter),
    Gauge(Gauge),
    GaugeFloat64(GaugeFloat64),
    Histogram(Histogram),
    Meter(Meter),
    Timer(Timer),
    Healthcheck(Healthcheck),
}

impl Metric {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::GaugeFloat64(_) => MetricKind::GaugeFloat64,
            Self::Histogram(_) => MetricKind::Histogram,
            Self::Meter(_) => MetricKind::Meter,
            Self::Timer(_) => MetricKind::Timer,
            Self::Healthcheck(_) => MetricKind::Healthcheck,
        }
    }

    /// Consistent point-in-time view of the metric.
    pub fn snapshot(&self) -> MetricSnapshot {
        match self {
            Self::Counter(m) => MetricSnapshot::Counter { count: m.count() },
            Self::Gauge(m) => MetricSnapshot::Gauge { value: m.value() },
            Self::GaugeFloat64(m) => MetricSnapshot::GaugeFloat64 { value: m.value() },
            Self::Histogram(m) => MetricSnapshot::Histogram(m.snapshot()),
            Self::Meter(m) => MetricSnapshot::Meter(m.snapshot()),
            Self::Timer(m) => MetricSnapshot::Timer(m.snapshot()),
            Self::Healthcheck(m) => {
                let error = m.error();
                MetricSnapshot::Healthcheck { healthy: error.is_none(), error }
            }
        }
    }
}

/// Serializable snapshot of a metric, used by the file and expvar exporters.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MetricSnapshot {
    Counter { count: i64 },
    Gauge { value: i64 },
    GaugeFloat64 { value: f64 },
    Histogram(HistogramSnapshot),
    Meter(MeterSnapshot),
    Timer(TimerSnapshot),
    Healthcheck { healthy: bool, error: Option<String> },
}

// ============================================================================
// Counter / gauges
// ============================================================================

/// Adjustable integer count.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    inner: Arc<AtomicI64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, n: i64) {
        self.inner.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dec(&self, n: i64) {
        self.inner.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.inner.store(0, Ordering::Relaxed);
    }

    pub fn count(&self) -> i64 {
        self.inner.load(Ordering::Relaxed)
    }
}

/// Last-write-wins integer value.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    inner: Arc<AtomicI64>,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.inner.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.inner.load(Ordering::Relaxed)
    }
}

/// Last-write-wins float value, stored as raw bits.
#[derive(Debug, Clone, Default)]
pub struct GaugeFloat64 {
    bits: Arc<AtomicU64>,
}

impl GaugeFloat64 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

// ============================================================================
// Histogram
// ============================================================================

/// Distribution over a reservoir sample.
#[derive(Debug, Clone)]
pub struct Histogram {
    sample: Arc<Mutex<Sample>>,
}

impl Histogram {
    /// Histogram over the default exponentially-decaying reservoir.
    pub fn new() -> Self {
        Self::with_sample(Sample::exp_decay())
    }

    /// Histogram over a caller-supplied reservoir (uniform in tests).
    pub fn with_sample(sample: Sample) -> Self {
        Self { sample: Arc::new(Mutex::new(sample)) }
    }

    pub fn update(&self, value: i64) {
        self.sample.lock().update(value);
    }

    pub fn clear(&self) {
        self.sample.lock().clear();
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let (count, values) = {
            let sample = self.sample.lock();
            (sample.count(), sample.values())
        };
        HistogramSnapshot::from_population(count, values)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p98: f64,
    pub p99: f64,
    pub p999: f64,
}

impl HistogramSnapshot {
    fn from_population(count: u64, values: Vec<i64>) -> Self {
        let min = values.iter().min().copied().unwrap_or(0);
        let max = values.iter().max().copied().unwrap_or(0);
        let mean = sample::mean(&values);
        let stddev = sample::std_dev(&values);
        let ps = sample::percentiles(values, &PERCENTILES);
        Self {
            count,
            min,
            max,
            mean,
            stddev,
            p50: ps[0],
            p75: ps[1],
            p95: ps[2],
            p98: ps[3],
            p99: ps[4],
            p999: ps[5],
        }
    }
}

// ============================================================================
// Meter
// ============================================================================

#[derive(Debug)]
struct MeterState {
    count: u64,
    start: Instant,
    last_tick: Instant,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

impl MeterState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            count: 0,
            start: now,
            last_tick: now,
            m1: Ewma::over_minutes(1.0),
            m5: Ewma::over_minutes(5.0),
            m15: Ewma::over_minutes(15.0),
        }
    }

    /// Advance the moving averages by every five-second step that has
    /// elapsed since the last observation.
    fn tick_if_needed(&mut self, now: Instant) {
        let step = Duration::from_secs(TICK_INTERVAL_SECS);
        while now.duration_since(self.last_tick) >= step {
            self.last_tick += step;
            self.m1.tick();
            self.m5.tick();
            self.m15.tick();
        }
    }
}

/// Event rate tracker: total count plus 1/5/15-minute moving averages and
/// a mean rate since creation.
#[derive(Debug, Clone)]
pub struct Meter {
    state: Arc<Mutex<MeterState>>,
}

impl Meter {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(MeterState::new())) }
    }

    pub fn mark(&self, n: u64) {
        let mut state = self.state.lock();
        state.tick_if_needed(Instant::now());
        state.count += n;
        state.m1.update(n);
        state.m5.update(n);
        state.m15.update(n);
    }

    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.tick_if_needed(now);
        let elapsed = now.duration_since(state.start).as_secs_f64();
        let rate_mean = if elapsed > 0.0 { state.count as f64 / elapsed } else { 0.0 };
        MeterSnapshot {
            count: state.count,
            rate1m: state.m1.rate(),
            rate5m: state.m5.rate(),
            rate15m: state.m15.rate(),
            rate_mean,
        }
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MeterSnapshot {
    pub count: u64,
    pub rate1m: f64,
    pub rate5m: f64,
    pub rate15m: f64,
    pub rate_mean: f64,
}

// ============================================================================
// Timer
// ============================================================================

/// Histogram of durations (in nanoseconds) plus meter-style rate tracking.
#[derive(Debug, Clone)]
pub struct Timer {
    histogram: Histogram,
    meter: Meter,
}

impl Timer {
    pub fn new() -> Self {
        Self::with_sample(Sample::exp_decay())
    }

    pub fn with_sample(sample: Sample) -> Self {
        Self { histogram: Histogram::with_sample(sample), meter: Meter::new() }
    }

    pub fn update(&self, duration: Duration) {
        self.histogram.update(duration.as_nanos().min(i64::MAX as u128) as i64);
        self.meter.mark(1);
    }

    /// Time a closure and record its duration.
    pub fn time<R>(&self, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let out = f();
        self.update(started.elapsed());
        out
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let histogram = self.histogram.snapshot();
        let rates = self.meter.snapshot();
        TimerSnapshot {
            histogram,
            rate1m: rates.rate1m,
            rate5m: rates.rate5m,
            rate15m: rates.rate15m,
            rate_mean: rates.rate_mean,
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerSnapshot {
    #[serde(flatten)]
    pub histogram: HistogramSnapshot,
    pub rate1m: f64,
    pub rate5m: f64,
    pub rate15m: f64,
    pub rate_mean: f64,
}

// ============================================================================
// Healthcheck
// ============================================================================

type CheckFn = dyn Fn() -> Result<(), String> + Send + Sync;

/// Named boolean-with-error state, recomputed on demand by running the
/// user-supplied check function.
#[derive(Clone)]
pub struct Healthcheck {
    check: Arc<CheckFn>,
    error: Arc<Mutex<Option<String>>>,
}

impl Healthcheck {
    pub fn new(check: impl Fn() -> Result<(), String> + Send + Sync + 'static) -> Self {
        Self { check: Arc::new(check), error: Arc::new(Mutex::new(None)) }
    }

    /// Run the check function and store its outcome.
    pub fn check(&self) {
        let outcome = (self.check)();
        *self.error.lock() = outcome.err();
    }

    /// Error message from the most recent check, if it failed.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }
}

impl fmt::Debug for Healthcheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Healthcheck").field("error", &*self.error.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_handles_share_state() {
        let counter = Counter::new();
        let other = counter.clone();
        counter.inc(40);
        other.inc(7);
        assert_eq!(counter.count(), 47);
        counter.dec(7);
        assert_eq!(other.count(), 40);
    }

    #[test]
    fn gauge_round_trips() {
        let gauge = Gauge::new();
        gauge.set(719);
        assert_eq!(gauge.value(), 719);

        let gauge_f = GaugeFloat64::new();
        gauge_f.set(71.9);
        assert_eq!(gauge_f.value(), 71.9);
    }

    #[test]
    fn histogram_snapshot_is_internally_consistent() {
        let histogram = Histogram::with_sample(Sample::uniform(100));
        for v in 1..=10 {
            histogram.update(v);
        }
        let snap = histogram.snapshot();
        assert_eq!(snap.count, 10);
        assert_eq!(snap.min, 1);
        assert_eq!(snap.max, 10);
        assert_eq!(snap.mean, 5.5);
        assert!(snap.p50 >= snap.min as f64 && snap.p999 <= snap.max as f64);
    }

    #[test]
    fn timer_percentiles_match_fixture() {
        let timer = Timer::with_sample(Sample::uniform(10));
        timer.update(Duration::from_secs(18));
        for _ in 0..9 {
            timer.update(Duration::from_secs(16));
        }
        let snap = timer.snapshot();
        let sixteen = Duration::from_secs(16).as_nanos() as f64;
        let eighteen = Duration::from_secs(18).as_nanos() as f64;
        assert_eq!(snap.histogram.p50, sixteen);
        assert_eq!(snap.histogram.p75, sixteen);
        assert_eq!(snap.histogram.p95, eighteen);
        assert_eq!(snap.histogram.p98, eighteen);
        assert_eq!(snap.histogram.p99, eighteen);
        assert_eq!(snap.histogram.p999, eighteen);
    }

    #[test]
    fn meter_counts_marks() {
        let meter = Meter::new();
        meter.mark(19);
        let snap = meter.snapshot();
        assert_eq!(snap.count, 19);
        assert!(snap.rate_mean >= 0.0);
    }

    #[test]
    fn healthcheck_recomputes_on_demand() {
        let healthy = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = std::sync::Arc::clone(&healthy);
        let check = Healthcheck::new(move || {
            if flag.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err("nope".to_string())
            }
        });

        check.check();
        assert_eq!(check.error(), None);

        healthy.store(false, Ordering::SeqCst);
        check.check();
        assert_eq!(check.error(), Some("nope".to_string()));
    }

    #[test]
    fn counter_snapshot_serializes_count_field() {
        let counter = Counter::new();
        counter.inc(47);
        let snap = Metric::Counter(counter).snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["count"], 47);
    }
}
