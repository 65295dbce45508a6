//! End-to-end exporter tests: each backend is exercised against a real
//! sink (temp file, local HTTP client, local UDP socket, wiremock).

use std::net::TcpListener;
use std::time::Duration;

use beacon_reporter::metrics::config::{
    CollectdConfig, ExporterConfig, ExpvarConfig, FileConfig, MetricsConfig, PrometheusConfig,
    PushGatewayConfig,
};
use beacon_reporter::metrics::MetricsReporter;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn free_port() -> u16 {
    // Bind-then-drop; the port stays free long enough for the exporter
    // to claim it.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

fn metrics_config(exporter: ExporterConfig) -> MetricsConfig {
    MetricsConfig { exporters: vec![exporter], ..MetricsConfig::default() }
}

#[tokio::test(flavor = "multi_thread")]
async fn file_exporter_appends_snapshot_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("metrics.log");

    let config = metrics_config(ExporterConfig::File(FileConfig {
        path: log_path.clone(),
        interval: Some(Duration::from_millis(100)),
    }));
    let mut reporter = MetricsReporter::new(config).expect("new");
    reporter.counter("requests").expect("counter").inc(47);
    reporter.start().await.expect("start");

    tokio::time::sleep(Duration::from_millis(350)).await;
    reporter.stop().await.expect("stop");

    let contents = std::fs::read_to_string(&log_path).expect("read log");
    let lines: Vec<&str> = contents.lines().collect();
    assert!(!lines.is_empty(), "expected at least one line, got none");
    let parsed: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
    assert_eq!(parsed["requests"]["count"], 47);
}

#[tokio::test(flavor = "multi_thread")]
async fn expvar_serves_metrics_and_healthz() {
    let port = free_port();
    let config = metrics_config(ExporterConfig::Expvar(ExpvarConfig {
        listen: format!("127.0.0.1:{port}"),
    }));
    let mut reporter = MetricsReporter::new(config).expect("new");
    reporter.counter("requests").expect("counter").inc(47);
    reporter.healthcheck("db", || Ok(())).expect("healthcheck");
    reporter.start().await.expect("start");

    let base = format!("http://127.0.0.1:{port}");
    let body: serde_json::Value = reqwest::get(format!("{base}/"))
        .await
        .expect("GET /")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["requests"]["count"], 47);

    let response = reqwest::get(format!("{base}/healthz")).await.expect("GET /healthz");
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["details"]["db"], "+ok");

    reporter.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn expvar_healthz_fails_with_542() {
    let port = free_port();
    let config = metrics_config(ExporterConfig::Expvar(ExpvarConfig {
        listen: format!("127.0.0.1:{port}"),
    }));
    let mut reporter = MetricsReporter::new(config).expect("new");
    reporter.healthcheck("cache", || Err("nope".to_string())).expect("healthcheck");
    reporter.start().await.expect("start");

    let response = reqwest::get(format!("http://127.0.0.1:{port}/healthz"))
        .await
        .expect("GET /healthz");
    assert_eq!(response.status().as_u16(), 542);
    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["status"], "fail");
    assert_eq!(body["details"]["cache"], "!nope");

    reporter.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn prometheus_pull_exposes_namespaced_gauges() {
    let port = free_port();
    let config = metrics_config(ExporterConfig::Prometheus(PrometheusConfig {
        listen: format!("127.0.0.1:{port}"),
        interval: Some(Duration::from_millis(100)),
        namespace: "beacon".to_string(),
        subsystem: "test".to_string(),
        certfile: None,
        keyfile: None,
        cacertfile: None,
    }));
    let mut reporter = MetricsReporter::new(config).expect("new");
    reporter.counter("api.requests").expect("counter").inc(47);
    reporter.start().await.expect("start");

    tokio::time::sleep(Duration::from_millis(350)).await;

    let text = reqwest::get(format!("http://127.0.0.1:{port}/metrics"))
        .await
        .expect("scrape")
        .text()
        .await
        .expect("text body");
    assert!(
        text.contains("beacon_test_api_requests_count 47"),
        "exposition missing counter:\n{text}"
    );

    reporter.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn collectd_sends_binary_datagrams() {
    let agent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.expect("bind agent");
    let agent_addr = agent.local_addr().expect("agent addr");

    let config = metrics_config(ExporterConfig::Collectd(CollectdConfig {
        connect: agent_addr.to_string(),
        interval: Some(Duration::from_millis(100)),
        exclude: vec!["collectd.*".to_string(), "internal.*".to_string()],
    }));
    let mut reporter = MetricsReporter::new(config).expect("new");
    reporter.counter("api.requests").expect("counter").inc(47);
    reporter.counter("internal.queue").expect("counter").inc(1);
    reporter.start().await.expect("start");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut packets = Vec::new();
    let mut buf = [0u8; 1024];
    while packets.len() < 3 {
        match tokio::time::timeout_at(deadline, agent.recv(&mut buf)).await {
            Ok(received) => packets.push(buf[..received.expect("recv")].to_vec()),
            Err(_) => break,
        }
    }
    reporter.stop().await.expect("stop");

    assert!(!packets.is_empty(), "no datagram within two seconds");
    // HOST part leads every packet.
    assert_eq!(&packets[0][..2], &[0x00, 0x00]);
    // The collectd type string travels in the TYPE part.
    let needle = b"counter\0";
    assert!(
        packets.iter().any(|p| p.windows(needle.len()).any(|w| w == needle)),
        "no TYPE part in any packet"
    );
    // Metrics matching an exclusion glob must never reach the agent.
    let excluded = b"internal\0";
    assert!(
        packets.iter().all(|p| !p.windows(excluded.len()).any(|w| w == excluded)),
        "excluded metric was exported"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn push_gateway_puts_encoded_batch() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/metrics/job/batch"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = metrics_config(ExporterConfig::Prompushgw(PushGatewayConfig {
        url: server.uri(),
        job: "batch".to_string(),
        certfile: None,
        keyfile: None,
        cacertfile: None,
    }));
    let mut reporter = MetricsReporter::new(config).expect("new");
    reporter.counter("batch.rows").expect("counter").inc(47);
    reporter.start().await.expect("start");

    reporter.push().await.expect("push");
    reporter.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn push_gateway_surfaces_rejection_status() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/metrics/job/batch"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = metrics_config(ExporterConfig::Prompushgw(PushGatewayConfig {
        url: server.uri(),
        job: "batch".to_string(),
        certfile: None,
        keyfile: None,
        cacertfile: None,
    }));
    let mut reporter = MetricsReporter::new(config).expect("new");
    reporter.start().await.expect("start");

    let err = reporter.push().await.expect_err("push should fail");
    assert!(err.to_string().contains("500"), "unexpected error: {err}");
    reporter.stop().await.expect("stop");
}
