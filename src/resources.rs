//! Process resource sampling while a run is in flight.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Resource figures observed over a monitoring window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub peak_memory_bytes: u64,
    pub last_memory_bytes: u64,
    pub peak_cpu_percent: f32,
    pub samples: usize,
}

impl ResourceUsage {
    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_bytes as f64 / BYTES_PER_MB
    }

    fn record(&mut self, memory_bytes: u64, cpu_percent: f32) {
        self.peak_memory_bytes = self.peak_memory_bytes.max(memory_bytes);
        self.last_memory_bytes = memory_bytes;
        self.peak_cpu_percent = self.peak_cpu_percent.max(cpu_percent);
        self.samples += 1;
    }
}

/// Reads resident memory and CPU usage of the current process.
pub struct ProcessSampler {
    system: System,
    pid: Pid,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// `(resident bytes, cpu percent)`, or `None` if the process is not visible.
    pub fn sample(&mut self) -> Option<(u64, f32)> {
        if !self.system.refresh_process(self.pid) {
            return None;
        }
        self.system.process(self.pid).map(|p| (p.memory(), p.cpu_usage()))
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Background sampler started before a run and stopped after it.
pub struct ResourceMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<ResourceUsage>,
}

impl ResourceMonitor {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

    pub fn start(interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut sampler = ProcessSampler::new();
            let mut usage = ResourceUsage::default();
            let mut ticker = tokio::time::interval(interval);
            debug!("📈 Resource monitor started (interval: {:?})", interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some((memory, cpu)) = sampler.sample() {
                            usage.record(memory, cpu);
                        }
                    }
                }
            }

            // One last reading so short runs still report something.
            if let Some((memory, cpu)) = sampler.sample() {
                usage.record(memory, cpu);
            }
            usage
        });

        Self { cancel, handle }
    }

    /// Stop sampling and return what was observed. `None` if nothing could be sampled.
    pub async fn stop(self) -> Option<ResourceUsage> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(usage) if usage.samples > 0 => {
                info!(
                    "📈 Peak memory {:.1} MB, peak CPU {:.1}% over {} samples",
                    usage.peak_memory_mb(),
                    usage.peak_cpu_percent,
                    usage.samples
                );
                Some(usage)
            }
            Ok(_) => {
                warn!("⚠️ Resource monitor collected no samples");
                None
            }
            Err(e) => {
                warn!("⚠️ Resource monitor task failed: {}", e);
                None
            }
        }
    }
}
