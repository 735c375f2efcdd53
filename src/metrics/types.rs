use serde::{Deserialize, Serialize};

/// Process CPU and memory usage, reported to admins with every sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SystemStats {
    pub cpu_usage: f32,
    /// Resident memory in MiB.
    pub memory_usage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PipelineCounters {
    pub samples_published: u64,
    pub demo_samples: u64,
    pub samples_dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub system: SystemStats,
    pub counters: PipelineCounters,
}
