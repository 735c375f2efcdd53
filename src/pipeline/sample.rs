use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::link::ConnectionState;
use crate::metrics::SystemStats;
use crate::settings::{CalibrationSettings, ConnectionSettings};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminSnapshot {
    pub connection_info: ConnectionInfo,
    pub system_stats: SystemStats,
}

/// One timestamped reading after calibration and filtering.
///
/// Built once by the producer and shared read-only with every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub raw_value: f64,
    pub calibrated_value: f64,
    pub filtered_value: f64,
    pub calibration: CalibrationSettings,
    pub connection: ConnectionState,
    pub connection_settings: ConnectionSettings,
    pub admin: AdminSnapshot,
    pub is_demo_data: bool,
}

/// Seconds since the Unix epoch with millisecond precision, as sent to clients.
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOrigin {
    Live,
    Demo,
}
