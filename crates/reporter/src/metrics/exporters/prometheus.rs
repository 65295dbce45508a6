//! Prometheus pull exporter.
//!
//! A bridge loop copies registry snapshots into a `prometheus::Registry`
//! every interval; a hyper server exposes the text exposition format at
//! any path. Composite metrics fan out into one gauge per component
//! (`<name>_count`, `<name>_mean`, `<name>_p99`, ...), all namespaced
//! under the configured `namespace_subsystem_` prefix.
//!
//! When the cert/key/CA triple is configured the listener speaks mutual
//! TLS: connections must present a client certificate signed by the
//! configured CA or the handshake is rejected.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::server::conn::Http;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server, StatusCode};
use parking_lot::Mutex;
use prometheus::{Encoder, Gauge, Opts, TextEncoder};
use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::config::{PrometheusConfig, TlsPaths};
use crate::metrics::metric::{Metric, MetricSnapshot};
use crate::metrics::registry::Registry;
use crate::metrics::supervisor::TaskGroup;
use crate::metrics::MetricsError;

use super::Exporter;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

// ============================================================================
// Bridge
// ============================================================================

/// Copies registry snapshots into a `prometheus::Registry`.
///
/// Gauges are created lazily on first sight of a metric component and
/// updated in place afterwards, so scrape output stays stable across
/// flushes.
pub(crate) struct PromBridge {
    registry: Registry,
    prom: prometheus::Registry,
    namespace: String,
    subsystem: String,
    gauges: Mutex<HashMap<String, Gauge>>,
}

impl PromBridge {
    pub(crate) fn new(registry: Registry, namespace: &str, subsystem: &str) -> Self {
        Self {
            registry,
            prom: prometheus::Registry::new(),
            namespace: namespace.to_string(),
            subsystem: subsystem.to_string(),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// Copy the current state of every registered metric into the
    /// Prometheus registry.
    ///
    /// A metric that the Prometheus registry rejects (an invalid gauge
    /// name, for instance) is logged and skipped; it never blocks the
    /// rest of the pass. Returns the number of skipped metrics.
    pub(crate) fn flush(&self) -> usize {
        let mut failed = 0;
        self.registry.each(|name, metric| {
            for (suffix, value) in components(metric) {
                let full = match suffix {
                    "" => sanitize(name),
                    suffix => format!("{}_{suffix}", sanitize(name)),
                };
                if let Err(error) = self.set(&full, value) {
                    failed += 1;
                    warn!(metric = name, gauge = %full, error = %error, "skipping metric");
                }
            }
        });
        failed
    }

    fn set(&self, name: &str, value: f64) -> Result<(), MetricsError> {
        let mut gauges = self.gauges.lock();
        if let Some(gauge) = gauges.get(name) {
            gauge.set(value);
            return Ok(());
        }
        let opts = Opts::new(name, format!("beacon metric {name}"))
            .namespace(self.namespace.clone())
            .subsystem(self.subsystem.clone());
        let gauge = Gauge::with_opts(opts)?;
        self.prom.register(Box::new(gauge.clone()))?;
        gauge.set(value);
        gauges.insert(name.to_string(), gauge);
        Ok(())
    }

    /// Text exposition of the bridged registry.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.prom.gather(), &mut buf)?;
        Ok(buf)
    }
}

/// Component gauges for a metric: `(suffix, value)` pairs. Healthchecks
/// surface as a single 0/1 `_healthy` gauge.
fn components(metric: &Metric) -> Vec<(&'static str, f64)> {
    match metric.snapshot() {
        MetricSnapshot::Counter { count } => vec![("count", count as f64)],
        MetricSnapshot::Gauge { value } => vec![("", value as f64)],
        MetricSnapshot::GaugeFloat64 { value } => vec![("", value)],
        MetricSnapshot::Meter(m) => vec![
            ("count", m.count as f64),
            ("rate1m", m.rate1m),
            ("rate5m", m.rate5m),
            ("rate15m", m.rate15m),
            ("rate_mean", m.rate_mean),
        ],
        MetricSnapshot::Histogram(h) => vec![
            ("count", h.count as f64),
            ("min", h.min as f64),
            ("max", h.max as f64),
            ("mean", h.mean),
            ("stddev", h.stddev),
            ("p50", h.p50),
            ("p75", h.p75),
            ("p95", h.p95),
            ("p98", h.p98),
            ("p99", h.p99),
            ("p999", h.p999),
        ],
        MetricSnapshot::Timer(t) => vec![
            ("count", t.histogram.count as f64),
            ("min", t.histogram.min as f64),
            ("max", t.histogram.max as f64),
            ("mean", t.histogram.mean),
            ("stddev", t.histogram.stddev),
            ("p50", t.histogram.p50),
            ("p75", t.histogram.p75),
            ("p95", t.histogram.p95),
            ("p98", t.histogram.p98),
            ("p99", t.histogram.p99),
            ("p999", t.histogram.p999),
            ("rate1m", t.rate1m),
            ("rate5m", t.rate5m),
            ("rate15m", t.rate15m),
            ("rate_mean", t.rate_mean),
        ],
        MetricSnapshot::Healthcheck { healthy, .. } => {
            vec![("healthy", if healthy { 1.0 } else { 0.0 })]
        }
    }
}

/// Prometheus metric names allow `[a-zA-Z0-9_:]`; everything else
/// (dots in particular) becomes an underscore.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect()
}

// ============================================================================
// Pull server
// ============================================================================

pub struct PrometheusExporter {
    config: PrometheusConfig,
    bridge: Arc<PromBridge>,
    listener: Option<std::net::TcpListener>,
    tls: Option<TlsAcceptor>,
}

impl PrometheusExporter {
    pub fn new(config: PrometheusConfig, registry: Registry) -> Self {
        let bridge =
            Arc::new(PromBridge::new(registry, &config.namespace, &config.subsystem));
        Self { config, bridge, listener: None, tls: None }
    }
}

#[async_trait]
impl Exporter for PrometheusExporter {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    async fn init(&mut self) -> Result<(), MetricsError> {
        let addr = self.config.listen_addr()?;
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|source| MetricsError::Io { context: "prometheus listen", source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| MetricsError::Io { context: "prometheus listen", source })?;
        if let Some(paths) = self.config.tls() {
            self.tls = Some(tls_acceptor(&paths)?);
            debug!(%addr, "prometheus endpoint bound (mutual TLS)");
        } else {
            debug!(%addr, "prometheus endpoint bound");
        }
        self.listener = Some(listener);
        Ok(())
    }

    fn run(&mut self, group: &mut TaskGroup) -> Result<(), MetricsError> {
        let listener = self.listener.take().ok_or(MetricsError::NotStarted)?;

        let bridge = Arc::clone(&self.bridge);
        let interval = self.config.interval();
        group.spawn("prometheus-bridge", move |cancel| flush_loop(bridge, interval, cancel));

        let bridge = Arc::clone(&self.bridge);
        match self.tls.take() {
            Some(acceptor) => {
                group.spawn("prometheus-https", move |cancel| {
                    serve_tls(listener, acceptor, bridge, cancel)
                });
            }
            None => {
                group.spawn("prometheus-http", move |cancel| serve(listener, bridge, cancel));
            }
        }
        Ok(())
    }
}

async fn flush_loop(
    bridge: Arc<PromBridge>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), MetricsError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                bridge.flush();
            }
        }
    }
}

fn scrape_response(bridge: &PromBridge) -> Response<Body> {
    match bridge.encode() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(body))
            .unwrap_or_else(|_| {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }),
        Err(error) => {
            warn!(error = %error, "failed to encode prometheus exposition");
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

async fn serve(
    listener: std::net::TcpListener,
    bridge: Arc<PromBridge>,
    cancel: CancellationToken,
) -> Result<(), MetricsError> {
    let make_service = make_service_fn(move |_conn| {
        let bridge = Arc::clone(&bridge);
        async move {
            Ok::<_, Infallible>(service_fn(move |_req| {
                let bridge = Arc::clone(&bridge);
                async move { Ok::<_, Infallible>(scrape_response(&bridge)) }
            }))
        }
    });

    let server = Server::from_tcp(listener)?.serve(make_service);
    let graceful = server.with_graceful_shutdown({
        let cancel = cancel.clone();
        async move { cancel.cancelled().await }
    });

    tokio::select! {
        outcome = graceful => outcome.map_err(MetricsError::from),
        () = async {
            cancel.cancelled().await;
            tokio::time::sleep(SHUTDOWN_DRAIN).await;
        } => {
            warn!("prometheus endpoint did not drain in time; abandoning connections");
            Ok(())
        }
    }
}

async fn serve_tls(
    listener: std::net::TcpListener,
    acceptor: TlsAcceptor,
    bridge: Arc<PromBridge>,
    cancel: CancellationToken,
) -> Result<(), MetricsError> {
    let listener = tokio::net::TcpListener::from_std(listener)
        .map_err(|source| MetricsError::Io { context: "prometheus listen", source })?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(error = %error, "prometheus accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let bridge = Arc::clone(&bridge);
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(error) => {
                            // Includes clients with no (or an untrusted)
                            // certificate.
                            debug!(%peer, error = %error, "TLS handshake rejected");
                            return;
                        }
                    };
                    let service = service_fn(move |_req| {
                        let bridge = Arc::clone(&bridge);
                        async move { Ok::<_, Infallible>(scrape_response(&bridge)) }
                    });
                    if let Err(error) =
                        Http::new().serve_connection(tls_stream, service).await
                    {
                        debug!(%peer, error = %error, "scrape connection error");
                    }
                });
            }
        }
    }
}

// ============================================================================
// TLS material
// ============================================================================

fn tls_acceptor(paths: &TlsPaths) -> Result<TlsAcceptor, MetricsError> {
    let certs = load_certs(&paths.certfile)?;
    let key = load_key(&paths.keyfile)?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(&paths.cacertfile)? {
        roots
            .add(&cert)
            .map_err(|source| MetricsError::Tls { context: "ca certificate", source })?;
    }

    let verifier = AllowAnyAuthenticatedClient::new(roots);
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(certs, key)
        .map_err(|source| MetricsError::Tls { context: "server certificate", source })?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &std::path::Path) -> Result<Vec<Certificate>, MetricsError> {
    let file = File::open(path)
        .map_err(|source| MetricsError::Io { context: "certificate file", source })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .map_err(|source| MetricsError::Io { context: "certificate file", source })?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &std::path::Path) -> Result<PrivateKey, MetricsError> {
    let file =
        File::open(path).map_err(|source| MetricsError::Io { context: "key file", source })?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file))
        .map_err(|source| MetricsError::Io { context: "key file", source })?;
    match keys.pop() {
        Some(key) => Ok(PrivateKey(key)),
        None => Err(MetricsError::Io {
            context: "key file",
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no PKCS#8 key found"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_dots() {
        assert_eq!(sanitize("api.requests.total"), "api_requests_total");
        assert_eq!(sanitize("already_clean:ok"), "already_clean:ok");
    }

    #[test]
    fn bridge_exports_counter_under_namespace() {
        let registry = Registry::new();
        registry.counter("api.requests").unwrap().inc(47);

        let bridge = PromBridge::new(registry, "beacon", "api");
        bridge.flush();

        let text = String::from_utf8(bridge.encode().unwrap()).unwrap();
        assert!(text.contains("beacon_api_api_requests_count 47"), "exposition:\n{text}");
    }

    #[test]
    fn bridge_updates_existing_gauges_in_place() {
        let registry = Registry::new();
        let counter = registry.counter("hits").unwrap();
        let bridge = PromBridge::new(registry, "ns", "sub");

        counter.inc(1);
        bridge.flush();
        counter.inc(1);
        bridge.flush();

        let text = String::from_utf8(bridge.encode().unwrap()).unwrap();
        assert!(text.contains("ns_sub_hits_count 2"), "exposition:\n{text}");
        // One sample line, not one per flush.
        let samples = text.lines().filter(|l| l.starts_with("ns_sub_hits_count")).count();
        assert_eq!(samples, 1);
    }

    #[test]
    fn rejected_metric_does_not_abort_the_pass() {
        let registry = Registry::new();
        // Sanitizes to a digit-leading name, which the prometheus
        // registry rejects when there is no namespace prefix.
        registry.counter("9bad").unwrap();
        for i in 0..10 {
            registry.counter(&format!("good.{i}")).unwrap().inc(1);
        }

        let bridge = PromBridge::new(registry, "", "");
        assert_eq!(bridge.flush(), 1);

        let text = String::from_utf8(bridge.encode().unwrap()).unwrap();
        for i in 0..10 {
            assert!(text.contains(&format!("good_{i}_count 1")), "missing good.{i}:\n{text}");
        }
    }

    #[test]
    fn timer_fans_out_into_component_gauges() {
        let registry = Registry::new();
        let timer = registry.timer("latency").unwrap();
        timer.update(Duration::from_millis(5));

        let bridge = PromBridge::new(registry, "ns", "sub");
        bridge.flush();

        let text = String::from_utf8(bridge.encode().unwrap()).unwrap();
        for suffix in ["count", "mean", "p50", "p999", "rate1m", "rate_mean"] {
            assert!(text.contains(&format!("ns_sub_latency_{suffix}")), "missing {suffix}");
        }
    }
}
