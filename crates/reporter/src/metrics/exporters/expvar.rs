//! Expvar-style HTTP exporter.
//!
//! Serves the registry on demand instead of pushing on a schedule:
//!
//! - `GET /` — every registered metric as one JSON object keyed by name.
//! - `GET /healthz` — runs every registered healthcheck and reports
//!   `{"status": "ok"|"fail", "details": {...}}`, where each detail is
//!   `"+ok"` for a passing check and `"!<message>"` for a failing one.
//!   The response status is 200 when all checks pass and 542 otherwise,
//!   so load balancers distinguish an unhealthy service from a broken
//!   handler.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::TcpListener;
use std::time::Duration;

use async_trait::async_trait;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::config::ExpvarConfig;
use crate::metrics::metric::{Metric, MetricSnapshot};
use crate::metrics::registry::Registry;
use crate::metrics::supervisor::TaskGroup;
use crate::metrics::MetricsError;

use super::Exporter;

/// Unhealthy services answer `/healthz` with this non-standard status.
const STATUS_UNHEALTHY: u16 = 542;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct HealthzBody {
    status: &'static str,
    details: BTreeMap<String, String>,
}

pub struct ExpvarExporter {
    config: ExpvarConfig,
    registry: Registry,
    listener: Option<TcpListener>,
}

impl ExpvarExporter {
    pub fn new(config: ExpvarConfig, registry: Registry) -> Self {
        Self { config, registry, listener: None }
    }
}

#[async_trait]
impl Exporter for ExpvarExporter {
    fn name(&self) -> &'static str {
        "expvar"
    }

    async fn init(&mut self) -> Result<(), MetricsError> {
        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .map_err(|source| MetricsError::Io { context: "expvar listen", source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| MetricsError::Io { context: "expvar listen", source })?;
        debug!(%addr, "expvar endpoint bound");
        self.listener = Some(listener);
        Ok(())
    }

    fn run(&mut self, group: &mut TaskGroup) -> Result<(), MetricsError> {
        let listener = self.listener.take().ok_or(MetricsError::NotStarted)?;
        let registry = self.registry.clone();
        group.spawn("expvar-http", move |cancel| serve(listener, registry, cancel));
        Ok(())
    }
}

async fn serve(
    listener: TcpListener,
    registry: Registry,
    cancel: CancellationToken,
) -> Result<(), MetricsError> {
    let make_service = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let registry = registry.clone();
                async move { Ok::<_, Infallible>(handle(&registry, &req)) }
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
            warn!("expvar endpoint did not drain in time; abandoning connections");
            Ok(())
        }
    }
}

fn handle(registry: &Registry, req: &Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => metrics_response(registry),
        (&Method::GET, "/healthz") => healthz_response(registry),
        _ => plain(StatusCode::NOT_FOUND, Body::from("not found")),
    }
}

fn metrics_response(registry: &Registry) -> Response<Body> {
    let mut snapshots: BTreeMap<String, MetricSnapshot> = BTreeMap::new();
    registry.each(|name, metric| {
        snapshots.insert(name.to_string(), metric.snapshot());
    });
    json_response(StatusCode::OK, &snapshots)
}

fn healthz_response(registry: &Registry) -> Response<Body> {
    let mut details = BTreeMap::new();
    let mut healthy = true;
    registry.each(|name, metric| {
        if let Metric::Healthcheck(check) = metric {
            check.check();
            let detail = match check.error() {
                None => "+ok".to_string(),
                Some(message) => {
                    healthy = false;
                    format!("!{message}")
                }
            };
            details.insert(name.to_string(), detail);
        }
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::from_u16(STATUS_UNHEALTHY).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    };
    let body = HealthzBody { status: if healthy { "ok" } else { "fail" }, details };
    json_response(status, &body)
}

fn json_response(status: StatusCode, body: &impl Serialize) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, Body::empty())),
        Err(error) => {
            warn!(error = %error, "failed to serialize expvar response");
            plain(StatusCode::INTERNAL_SERVER_ERROR, Body::empty())
        }
    }
}

fn plain(status: StatusCode, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_lists_registered_metrics() {
        let registry = Registry::new();
        registry.counter("requests").unwrap().inc(47);

        let response = metrics_response(&registry);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn healthz_reports_ok_when_all_checks_pass() {
        let registry = Registry::new();
        registry.healthcheck("db", || Ok(())).unwrap();

        let response = healthz_response(&registry);
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn healthz_reports_542_when_a_check_fails() {
        let registry = Registry::new();
        registry.healthcheck("db", || Ok(())).unwrap();
        registry.healthcheck("cache", || Err("nope".to_string())).unwrap();

        let response = healthz_response(&registry);
        assert_eq!(response.status().as_u16(), 542);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let registry = Registry::new();
        let req = Request::builder().method(Method::GET).uri("/nope").body(Body::empty()).unwrap();
        let response = handle(&registry, &req);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
