//! Prometheus push-gateway exporter.
//!
//! Unlike the other backends this one has no loop: pushes happen only
//! when the caller asks for one, typically at the end of a batch job.
//! Each push syncs the bridge and PUTs the text exposition to
//! `<url>/metrics/job/<job>`. An optional client certificate triple
//! authenticates the client to the gateway.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::metrics::config::{PushGatewayConfig, TlsPaths};
use crate::metrics::registry::Registry;
use crate::metrics::MetricsError;

use super::prometheus::PromBridge;

pub struct PushGateway {
    config: PushGatewayConfig,
    bridge: Arc<PromBridge>,
    endpoint: String,
    client: OnceCell<reqwest::Client>,
}

impl PushGateway {
    pub fn new(config: PushGatewayConfig, registry: Registry) -> Self {
        // Bridged without a namespace: the gateway's grouping key carries
        // the job identity.
        let bridge = Arc::new(PromBridge::new(registry, "", ""));
        let endpoint =
            format!("{}/metrics/job/{}", config.url.trim_end_matches('/'), config.job);
        Self { config, bridge, endpoint, client: OnceCell::new() }
    }

    /// Build the HTTP client. Runs once during reporter start; TLS
    /// material that fails to load fails the whole start.
    pub(crate) fn init(&self) -> Result<(), MetricsError> {
        let client = self.build_client()?;
        let _ = self.client.set(client);
        debug!(endpoint = %self.endpoint, "push gateway client ready");
        Ok(())
    }

    /// Sync the bridge and push the batch to the gateway.
    pub async fn push(&self) -> Result<(), MetricsError> {
        let client = self.client.get().ok_or(MetricsError::NotStarted)?;
        self.bridge.flush();
        let body = self.bridge.encode()?;

        let response = client
            .put(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetricsError::PushRejected { status: status.as_u16() });
        }
        debug!(endpoint = %self.endpoint, "pushed metrics batch");
        Ok(())
    }

    fn build_client(&self) -> Result<reqwest::Client, MetricsError> {
        let mut builder = reqwest::Client::builder();
        if let Some(paths) = self.config.tls() {
            builder = with_client_tls(builder, &paths)?;
        }
        Ok(builder.build()?)
    }
}

fn with_client_tls(
    builder: reqwest::ClientBuilder,
    paths: &TlsPaths,
) -> Result<reqwest::ClientBuilder, MetricsError> {
    let read = |path: &std::path::Path| {
        std::fs::read(path)
            .map_err(|source| MetricsError::Io { context: "client certificate", source })
    };
    // Identity wants key and cert chain in one PEM bundle.
    let mut bundle = read(&paths.keyfile)?;
    bundle.extend_from_slice(&read(&paths.certfile)?);
    let identity = reqwest::Identity::from_pem(&bundle)?;
    let ca = reqwest::Certificate::from_pem(&read(&paths.cacertfile)?)?;
    Ok(builder.use_rustls_tls().identity(identity).add_root_certificate(ca))
}
