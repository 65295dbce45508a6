//! Process runtime metrics.
//!
//! A background loop samples the current process through `sysinfo` and
//! publishes the readings as gauges under the `process.` prefix.

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::registry::Registry;
use super::supervisor::TaskGroup;
use super::MetricsError;

pub(crate) fn spawn(
    group: &mut TaskGroup,
    registry: Registry,
    interval: Duration,
) -> Result<(), MetricsError> {
    let resident = registry.gauge("memory.resident")?;
    let virt = registry.gauge("memory.virtual")?;
    let cpu = registry.gauge_f64("cpu.percent")?;
    let uptime = registry.gauge("uptime.seconds")?;

    let pid = sysinfo::get_current_pid()
        .map_err(|message| MetricsError::Runtime { message: message.to_string() })?;

    group.spawn("runtime-metrics", move |cancel| {
        sample_loop(pid, resident, virt, cpu, uptime, interval, cancel)
    });
    Ok(())
}

async fn sample_loop(
    pid: Pid,
    resident: super::metric::Gauge,
    virt: super::metric::Gauge,
    cpu: super::metric::GaugeFloat64,
    uptime: super::metric::Gauge,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), MetricsError> {
    let mut system = System::new();
    let refresh = ProcessRefreshKind::new().with_memory().with_cpu();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                system.refresh_process_specifics(pid, refresh);
                match system.process(pid) {
                    Some(process) => {
                        resident.set(process.memory().min(i64::MAX as u64) as i64);
                        virt.set(process.virtual_memory().min(i64::MAX as u64) as i64);
                        cpu.set(f64::from(process.cpu_usage()));
                        uptime.set(process.run_time().min(i64::MAX as u64) as i64);
                    }
                    None => warn!(%pid, "own process missing from snapshot"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn publishes_process_gauges() {
        let registry = Registry::new();
        let mut group = TaskGroup::new();
        spawn(&mut group, registry.child("process"), Duration::from_millis(10)).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        group.shutdown().await.unwrap();

        let resident = registry.gauge("process.memory.resident").unwrap();
        assert!(resident.value() > 0, "resident set size should be non-zero");
    }
}
