//! File exporter.
//!
//! Appends one JSON object per tick to a log file, each line keyed by
//! metric name. The file is opened (create/append) during `init` so a
//! bad path fails the reporter start instead of the first tick. Write
//! failures are logged and counted against the next tick; they never
//! kill the loop.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::config::FileConfig;
use crate::metrics::metric::MetricSnapshot;
use crate::metrics::registry::Registry;
use crate::metrics::supervisor::TaskGroup;
use crate::metrics::MetricsError;

use super::Exporter;

pub struct FileExporter {
    config: FileConfig,
    registry: Registry,
    file: Option<File>,
}

impl FileExporter {
    pub fn new(config: FileConfig, registry: Registry) -> Self {
        Self { config, registry, file: None }
    }
}

#[async_trait]
impl Exporter for FileExporter {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn init(&mut self) -> Result<(), MetricsError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .await
            .map_err(|source| MetricsError::Io { context: "file exporter open", source })?;
        debug!(path = %self.config.path.display(), "metrics log file opened");
        self.file = Some(file);
        Ok(())
    }

    fn run(&mut self, group: &mut TaskGroup) -> Result<(), MetricsError> {
        let file = self.file.take().ok_or(MetricsError::NotStarted)?;
        let registry = self.registry.clone();
        let interval = self.config.interval();
        group.spawn("file-exporter", move |cancel| write_loop(file, registry, interval, cancel));
        Ok(())
    }
}

async fn write_loop(
    mut file: File,
    registry: Registry,
    interval: std::time::Duration,
    cancel: CancellationToken,
) -> Result<(), MetricsError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; skip it so the
    // first line lands after one full interval.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(error) = write_once(&mut file, &registry).await {
                    warn!(error = %error, "failed to append metrics line");
                }
            }
        }
    }

    if let Err(error) = file.flush().await {
        warn!(error = %error, "failed to flush metrics log file on shutdown");
    }
    Ok(())
}

async fn write_once(file: &mut File, registry: &Registry) -> Result<(), MetricsError> {
    let mut snapshots: BTreeMap<String, MetricSnapshot> = BTreeMap::new();
    registry.each(|name, metric| {
        snapshots.insert(name.to_string(), metric.snapshot());
    });

    let mut line = serde_json::to_vec(&snapshots)
        .map_err(|source| MetricsError::Serialize { context: "file exporter", source })?;
    line.push(b'\n');

    file.write_all(&line)
        .await
        .map_err(|source| MetricsError::Io { context: "file exporter write", source })?;
    file.flush()
        .await
        .map_err(|source| MetricsError::Io { context: "file exporter flush", source })?;
    Ok(())
}
