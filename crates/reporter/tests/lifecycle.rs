//! Façade lifecycle tests: YAML-driven construction, start/stop
//! ordering, and behavior of unconfigured sections.

use std::collections::HashMap;
use std::time::Duration;

use beacon_reporter::{Config, Reporter, ReporterError};

#[tokio::test(flavor = "multi_thread")]
async fn yaml_config_drives_the_full_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("metrics.log");

    let yaml = format!(
        r#"
errors:
  tags:
    service: beacon-tests
metrics:
  flush_interval: 1
  exporters:
    - file:
        path: {}
        interval: 0.1
"#,
        log_path.display()
    );
    let config: Config = serde_yaml::from_str(&yaml).expect("decode config");
    let mut reporter = Reporter::new(config).expect("new");

    reporter.counter("requests").expect("counter").inc(47);
    reporter.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(350)).await;
    reporter.stop().await.expect("stop");

    let contents = std::fs::read_to_string(&log_path).expect("read log");
    let line = contents.lines().next().expect("one line");
    let parsed: serde_json::Value = serde_json::from_str(line).expect("json");
    assert_eq!(parsed["requests"]["count"], 47);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_config_fails_construction() {
    let yaml = r#"
metrics:
  exporters:
    - prometheus:
        listen: 127.0.0.1:9090
        interval: 5
        namespace: beacon
        subsystem: api
        certfile: /etc/tls/cert.pem
"#;
    let config: Config = serde_yaml::from_str(yaml).expect("decode config");
    let err = Reporter::new(config).expect_err("partial TLS triple must fail");
    assert!(matches!(err, ReporterError::Metrics(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_before_start_returns_promptly() {
    let yaml = r#"
metrics:
  exporters: []
"#;
    let config: Config = serde_yaml::from_str(yaml).expect("decode config");
    let mut reporter = Reporter::new(config).expect("new");
    tokio::time::timeout(Duration::from_secs(1), reporter.stop())
        .await
        .expect("stop must not hang")
        .expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn metric_handles_survive_restart() {
    let config: Config = serde_yaml::from_str("metrics: {}").expect("decode config");
    let mut reporter = Reporter::new(config).expect("new");

    let counter = reporter.counter("requests").expect("counter");
    counter.inc(40);
    reporter.start().await.expect("start");
    reporter.stop().await.expect("stop");
    counter.inc(7);

    assert_eq!(reporter.counter("requests").expect("counter").count(), 47);
}

#[test]
fn capture_merges_static_tags() {
    let yaml = r#"
errors:
  tags:
    env: test
"#;
    let config: Config = serde_yaml::from_str(yaml).expect("decode config");
    let reporter = Reporter::new(config).expect("new");
    let error = std::io::Error::new(std::io::ErrorKind::Other, "boom");
    // Goes to the default tracing sink; must not panic without a
    // subscriber installed.
    reporter.capture(&error, &HashMap::from([("job".to_string(), "sync".to_string())]));
}
