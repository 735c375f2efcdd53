mod types;

pub use types::{MetricsSnapshot, PipelineCounters, SystemStats};

use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    counters: PipelineCounters,
    system: System,
    pid: Pid,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish baseline for CPU calculation
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                counters: PipelineCounters::default(),
                system,
                pid,
            })),
        }
    }

    /// Sample current CPU and memory usage of this process.
    /// CPU usage requires multiple refreshes over time to calculate delta.
    pub async fn sample_system_stats(&self) -> SystemStats {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        match state.system.process(pid) {
            Some(process) => SystemStats {
                cpu_usage: process.cpu_usage(),
                memory_usage: process.memory() as f64 / 1024.0 / 1024.0,
            },
            None => SystemStats::default(),
        }
    }

    pub async fn record_published(&self, is_demo: bool) {
        let mut state = self.inner.lock().await;
        state.counters.samples_published += 1;
        if is_demo {
            state.counters.demo_samples += 1;
        }
    }

    pub async fn record_dropped(&self) {
        self.inner.lock().await.counters.samples_dropped += 1;
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let system = self.sample_system_stats().await;
        let counters = self.inner.lock().await.counters;
        MetricsSnapshot { system, counters }
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_track_live_and_demo_samples() {
        let metrics = MetricsCollector::new();
        metrics.record_published(false).await;
        metrics.record_published(true).await;
        metrics.record_dropped().await;

        let snapshot = metrics.get_snapshot().await;
        assert_eq!(snapshot.counters.samples_published, 2);
        assert_eq!(snapshot.counters.demo_samples, 1);
        assert_eq!(snapshot.counters.samples_dropped, 1);
        assert!(snapshot.system.memory_usage >= 0.0);
    }
}
