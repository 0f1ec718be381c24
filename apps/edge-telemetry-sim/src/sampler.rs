//! Background CPU sampling that overlaps a blocking unit of work.
//!
//! A [`ResourceSampler`] is started right before the timed section and stopped right after
//! it. The sampling loop runs as its own tokio task on a fixed interval; stopping cancels
//! the task, joins it and averages what it collected.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

pub trait ResourceProbe: Send + Sync {
    /// Opens a CPU measurement window; the next `cpu_percent` covers the time since.
    fn begin_cpu_window(&self) {}

    /// CPU utilisation of the process since the previous reading, in percent.
    fn cpu_percent(&self) -> Result<f32>;

    /// Must not disturb the CPU measurement window.
    fn resident_memory_mb(&self) -> Result<f64>;
}

/// Probe for the current process backed by `sysinfo`.
pub struct SysinfoProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn current_process() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|err| anyhow!(err))?;
        let refresh = RefreshKind::nothing()
            .with_processes(ProcessRefreshKind::nothing().with_cpu().with_memory());
        let mut system = System::new_with_specifics(refresh);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        Ok(Self {
            pid,
            system: Mutex::new(system),
        })
    }

    fn refresh<T>(
        &self,
        kind: ProcessRefreshKind,
        read: impl FnOnce(&sysinfo::Process) -> T,
    ) -> Result<T> {
        let mut system = self
            .system
            .lock()
            .map_err(|_| anyhow!("sysinfo state poisoned"))?;
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[self.pid]), true, kind);
        let process = system
            .process(self.pid)
            .ok_or_else(|| anyhow!("process {} not visible", self.pid))?;
        Ok(read(process))
    }
}

impl ResourceProbe for SysinfoProbe {
    fn begin_cpu_window(&self) {
        if let Err(err) = self.refresh(ProcessRefreshKind::nothing().with_cpu(), |_| ()) {
            tracing::debug!(error=%err, "cpu window refresh failed");
        }
    }

    fn cpu_percent(&self) -> Result<f32> {
        let value = self.refresh(ProcessRefreshKind::nothing().with_cpu(), |process| {
            process.cpu_usage()
        })?;
        if value.is_finite() && value >= 0.0 {
            Ok(value)
        } else {
            Err(anyhow!("invalid cpu reading {value}"))
        }
    }

    fn resident_memory_mb(&self) -> Result<f64> {
        let bytes = self.refresh(ProcessRefreshKind::nothing().with_memory(), |process| {
            process.memory()
        })?;
        Ok(bytes as f64 / (1024.0 * 1024.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuUsage {
    pub average: f64,
    pub samples: usize,
}

pub struct ResourceSampler;

impl ResourceSampler {
    pub fn start(probe: Arc<dyn ResourceProbe>, interval: Duration) -> RunningSampler {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task_probe = probe.clone();
        let interval = interval.max(Duration::from_millis(1));
        probe.begin_cpu_window();
        let handle = tokio::spawn(async move {
            let mut samples = Vec::new();
            // First sample one full interval after start, never at t=0.
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match task_probe.cpu_percent() {
                            Ok(value) => samples.push(f64::from(value)),
                            Err(err) => tracing::debug!(error=%err, "cpu sample failed"),
                        }
                    }
                }
            }
            samples
        });
        RunningSampler {
            probe,
            cancel,
            handle: Some(handle),
        }
    }
}

pub struct RunningSampler {
    probe: Arc<dyn ResourceProbe>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Vec<f64>>>,
}

impl RunningSampler {
    pub async fn stop(mut self) -> CpuUsage {
        self.cancel.cancel();
        let samples = match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(samples) => samples,
                Err(err) => {
                    tracing::debug!(error=%err, "sampler task did not finish cleanly");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        if samples.is_empty() {
            // Work finished inside the first interval: fall back to one fresh reading.
            let average = self
                .probe
                .cpu_percent()
                .map(f64::from)
                .unwrap_or(0.0);
            return CpuUsage {
                average,
                samples: 0,
            };
        }
        CpuUsage {
            average: samples.iter().sum::<f64>() / samples.len() as f64,
            samples: samples.len(),
        }
    }
}

impl Drop for RunningSampler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
