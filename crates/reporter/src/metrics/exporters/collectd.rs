//! Collectd exporter.
//!
//! Sends one binary value-list datagram per metric per tick over UDP.
//! The wire format is the collectd network protocol: a sequence of typed
//! parts, each with a big-endian u16 type and u16 length (length covers
//! the 4-byte part header).
//!
//! Part layout per datagram:
//!
//! | part            | id     | payload                                  |
//! |-----------------|--------|------------------------------------------|
//! | HOST            | 0x0000 | nul-terminated fully-qualified hostname  |
//! | TIME            | 0x0001 | u64 BE unix seconds                      |
//! | INTERVAL        | 0x0007 | u64 BE seconds                           |
//! | PLUGIN          | 0x0002 | metric name up to the last `.`           |
//! | PLUGIN_INSTANCE | 0x0003 | metric name after the last `.`           |
//! | TYPE            | 0x0004 | collectd type string for the kind        |
//! | VALUES          | 0x0006 | u16 BE count, count type bytes, values   |
//!
//! Values are COUNTER (type byte 0, u64 big-endian) or GAUGE (type byte 1,
//! f64 little-endian). Delivery is best-effort: send failures are counted
//! and logged, never fatal. Healthchecks are not exportable as value lists
//! and are skipped, as is any metric matching an exclusion glob.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trust_dns_resolver::TokioAsyncResolver;

use crate::metrics::config::CollectdConfig;
use crate::metrics::metric::{Meter, Metric, MetricSnapshot};
use crate::metrics::registry::Registry;
use crate::metrics::supervisor::TaskGroup;
use crate::metrics::MetricsError;

use super::Exporter;

const PART_HOST: u16 = 0x0000;
const PART_TIME: u16 = 0x0001;
const PART_PLUGIN: u16 = 0x0002;
const PART_PLUGIN_INSTANCE: u16 = 0x0003;
const PART_TYPE: u16 = 0x0004;
const PART_VALUES: u16 = 0x0006;
const PART_INTERVAL: u16 = 0x0007;

const VALUE_COUNTER: u8 = 0;
const VALUE_GAUGE: u8 = 1;

/// One element of a collectd value list.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Counter(u64),
    Gauge(f64),
}

pub struct CollectdExporter {
    config: CollectdConfig,
    registry: Registry,
    exclude: Vec<glob::Pattern>,
    sent: Meter,
    failed: Meter,
    socket: Option<UdpSocket>,
    resolver: Option<TokioAsyncResolver>,
}

impl CollectdExporter {
    pub fn new(config: CollectdConfig, registry: Registry) -> Result<Self, MetricsError> {
        let mut exclude = Vec::with_capacity(config.exclude.len());
        for pattern in &config.exclude {
            exclude.push(glob::Pattern::new(pattern).map_err(|source| {
                crate::config::ConfigError::InvalidPattern { pattern: pattern.clone(), source }
            })?);
        }
        let internal = registry.child("collectd");
        let sent = internal.meter("datagrams.sent")?;
        let failed = internal.meter("datagrams.failed")?;
        Ok(Self { config, registry, exclude, sent, failed, socket: None, resolver: None })
    }
}

#[async_trait]
impl Exporter for CollectdExporter {
    fn name(&self) -> &'static str {
        "collectd"
    }

    async fn init(&mut self) -> Result<(), MetricsError> {
        let addr = self.config.connect_addr()?;
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|source| MetricsError::Io { context: "collectd bind", source })?;
        socket
            .connect(addr)
            .await
            .map_err(|source| MetricsError::Io { context: "collectd connect", source })?;
        debug!(%addr, "collectd socket connected");
        self.socket = Some(socket);
        // The HOST part carries the fully-qualified name; without a
        // usable system resolver the short hostname is sent instead.
        self.resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Some(resolver),
            Err(error) => {
                warn!(error = %error, "system resolver unavailable; sending short hostname");
                None
            }
        };
        Ok(())
    }

    fn run(&mut self, group: &mut TaskGroup) -> Result<(), MetricsError> {
        let socket = self.socket.take().ok_or(MetricsError::NotStarted)?;
        let loop_state = SendLoop {
            socket,
            registry: self.registry.clone(),
            exclude: self.exclude.clone(),
            interval: self.config.interval(),
            sent: self.sent.clone(),
            failed: self.failed.clone(),
            resolver: self.resolver.take(),
        };
        group.spawn("collectd-exporter", move |cancel| loop_state.run(cancel));
        Ok(())
    }
}

struct SendLoop {
    socket: UdpSocket,
    registry: Registry,
    exclude: Vec<glob::Pattern>,
    interval: Duration,
    sent: Meter,
    failed: Meter,
    resolver: Option<TokioAsyncResolver>,
}

impl SendLoop {
    async fn run(self, cancel: CancellationToken) -> Result<(), MetricsError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.send_tick().await,
            }
        }
    }

    async fn send_tick(&self) {
        // Resolve on every tick so renames are picked up; a resolution
        // failure skips the whole tick rather than sending a wrong host.
        let short = match hostname::get() {
            Ok(host) => host.to_string_lossy().into_owned(),
            Err(error) => {
                warn!(error = %error, "hostname lookup failed; skipping collectd tick");
                return;
            }
        };
        let host = resolve_fqdn(self.resolver.as_ref(), &short).await;

        for packet in build_batch(&self.registry, &self.exclude, &host, self.interval) {
            match self.socket.send(&packet).await {
                Ok(_) => self.sent.mark(1),
                Err(error) => {
                    self.failed.mark(1);
                    warn!(error = %error, "failed to send collectd datagram");
                }
            }
        }
    }
}

/// Encode one datagram per exportable metric. Metrics matching an
/// exclusion glob are skipped; they stay readable in the registry.
fn build_batch(
    registry: &Registry,
    exclude: &[glob::Pattern],
    host: &str,
    interval: Duration,
) -> Vec<Vec<u8>> {
    let mut batch = Vec::new();
    registry.each(|name, metric| {
        if exclude.iter().any(|pattern| pattern.matches(name)) {
            return;
        }
        if let Some(values) = value_list(metric) {
            batch.push(encode_packet(host, interval, name, metric, &values));
        }
    });
    batch
}

/// Forward-resolve the short hostname, then reverse-resolve its first
/// IPv4 address back to the canonical name, trailing dot stripped. Any
/// lookup failure falls back to the short name.
async fn resolve_fqdn(resolver: Option<&TokioAsyncResolver>, short: &str) -> String {
    let Some(resolver) = resolver else {
        return short.to_string();
    };
    let ips = match resolver.lookup_ip(short).await {
        Ok(ips) => ips,
        Err(_) => return short.to_string(),
    };
    let Some(ip) = ips.iter().find(|ip| ip.is_ipv4()) else {
        return short.to_string();
    };
    match resolver.reverse_lookup(ip).await {
        Ok(names) => match names.iter().next() {
            Some(name) => name.to_utf8().trim_end_matches('.').to_string(),
            None => short.to_string(),
        },
        Err(_) => short.to_string(),
    }
}

/// Value list for a metric, in collectd field order. `None` means the
/// metric kind has no value-list representation.
fn value_list(metric: &Metric) -> Option<Vec<Value>> {
    match metric.snapshot() {
        MetricSnapshot::Counter { count } => Some(vec![Value::Counter(count.max(0) as u64)]),
        MetricSnapshot::Gauge { value } => Some(vec![Value::Gauge(value as f64)]),
        MetricSnapshot::GaugeFloat64 { value } => Some(vec![Value::Gauge(value)]),
        MetricSnapshot::Meter(m) => Some(vec![
            Value::Counter(m.count),
            Value::Gauge(m.rate1m),
            Value::Gauge(m.rate5m),
            Value::Gauge(m.rate15m),
            Value::Gauge(m.rate_mean),
        ]),
        MetricSnapshot::Histogram(h) => Some(vec![
            Value::Counter(h.count),
            Value::Gauge(h.max as f64),
            Value::Gauge(h.mean),
            Value::Gauge(h.min as f64),
            Value::Gauge(h.stddev),
            Value::Gauge(h.p50),
            Value::Gauge(h.p75),
            Value::Gauge(h.p95),
            Value::Gauge(h.p98),
            Value::Gauge(h.p99),
            Value::Gauge(h.p999),
        ]),
        MetricSnapshot::Timer(t) => Some(vec![
            Value::Gauge(t.histogram.max as f64),
            Value::Gauge(t.histogram.mean),
            Value::Gauge(t.histogram.min as f64),
            Value::Gauge(t.histogram.stddev),
            Value::Gauge(t.histogram.p50),
            Value::Gauge(t.histogram.p75),
            Value::Gauge(t.histogram.p95),
            Value::Gauge(t.histogram.p98),
            Value::Gauge(t.histogram.p99),
            Value::Gauge(t.histogram.p999),
        ]),
        MetricSnapshot::Healthcheck { .. } => None,
    }
}

/// Collectd type string for a metric. Both gauge kinds share one type;
/// healthchecks are filtered out before this is reached.
fn type_name(metric: &Metric) -> &'static str {
    use crate::metrics::metric::MetricKind;
    match metric.kind() {
        MetricKind::Counter => "counter",
        MetricKind::Gauge | MetricKind::GaugeFloat64 => "gauge",
        MetricKind::Histogram => "histogram",
        MetricKind::Meter => "meter",
        MetricKind::Timer => "timer",
        // Filtered out before encoding; kept for exhaustiveness.
        MetricKind::Healthcheck => "gauge",
    }
}

/// `plugin` is the metric name up to the last dot, `plugin_instance` the
/// rest. Undotted names become the whole plugin with an empty instance.
fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(at) => (&name[..at], &name[at + 1..]),
        None => (name, ""),
    }
}

fn encode_packet(
    host: &str,
    interval: Duration,
    name: &str,
    metric: &Metric,
    values: &[Value],
) -> Vec<u8> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let (plugin, instance) = split_name(name);

    let mut buf = Vec::with_capacity(128);
    push_string_part(&mut buf, PART_HOST, host);
    push_numeric_part(&mut buf, PART_TIME, now);
    push_numeric_part(&mut buf, PART_INTERVAL, interval.as_secs());
    push_string_part(&mut buf, PART_PLUGIN, plugin);
    if !instance.is_empty() {
        push_string_part(&mut buf, PART_PLUGIN_INSTANCE, instance);
    }
    push_string_part(&mut buf, PART_TYPE, type_name(metric));
    push_values_part(&mut buf, values);
    buf
}

fn push_string_part(buf: &mut Vec<u8>, part: u16, s: &str) {
    let len = (4 + s.len() + 1) as u16;
    buf.extend_from_slice(&part.to_be_bytes());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

fn push_numeric_part(buf: &mut Vec<u8>, part: u16, value: u64) {
    buf.extend_from_slice(&part.to_be_bytes());
    buf.extend_from_slice(&12u16.to_be_bytes());
    buf.extend_from_slice(&value.to_be_bytes());
}

fn push_values_part(buf: &mut Vec<u8>, values: &[Value]) {
    let n = values.len() as u16;
    let len = 4 + 2 + values.len() as u16 * 9;
    buf.extend_from_slice(&PART_VALUES.to_be_bytes());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&n.to_be_bytes());
    for value in values {
        buf.push(match value {
            Value::Counter(_) => VALUE_COUNTER,
            Value::Gauge(_) => VALUE_GAUGE,
        });
    }
    for value in values {
        match value {
            // Counters are big-endian, gauges little-endian (x86 host
            // order), per the collectd network protocol.
            Value::Counter(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Gauge(v) => buf.extend_from_slice(&v.to_le_bytes()),
        }
    }
}
