//! Metric exporters.
//!
//! Exporters deliver registry snapshots to external monitoring systems.
//! Each backend splits its lifecycle in two: `init` acquires external
//! resources (sockets, files, TLS material) and fails fast, `run` registers
//! the backend's background loops on the shared [`TaskGroup`]. Backends
//! without a loop (expvar serves on demand) still follow the same shape so
//! the reporter can drive them uniformly.

pub mod collectd;
pub mod expvar;
pub mod file;
pub mod prometheus;
pub mod pushgw;

use async_trait::async_trait;

use super::supervisor::TaskGroup;
use super::MetricsError;

pub use collectd::CollectdExporter;
pub use expvar::ExpvarExporter;
pub use file::FileExporter;
pub use prometheus::PrometheusExporter;
pub use pushgw::PushGateway;

/// A configured exporter backend.
#[async_trait]
pub trait Exporter: Send {
    /// Backend name used in logs and error reports.
    fn name(&self) -> &'static str;

    /// Acquire the backend's external resources. Runs once, before any
    /// loop starts; an error here aborts the whole reporter start.
    async fn init(&mut self) -> Result<(), MetricsError>;

    /// Register this backend's background loops on the group.
    fn run(&mut self, group: &mut TaskGroup) -> Result<(), MetricsError>;
}
