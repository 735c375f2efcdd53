use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use crate::error::{EngineError, EngineResult};

/// Largest per-read buffer the link will allocate.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub timeout_seconds: u64,
    pub retry_attempts: u32,
    pub buffer_size: usize,
    pub reconnect_delay_seconds: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 2345,
            timeout_seconds: 30,
            retry_attempts: 3,
            buffer_size: 1024,
            reconnect_delay_seconds: 5,
        }
    }
}

impl ConnectionSettings {
    /// Checks the record invariants: non-empty host, every numeric field > 0.
    pub fn validate(&self) -> EngineResult<()> {
        if self.host.trim().is_empty() {
            return Err(EngineError::Validation("host must not be empty".into()));
        }
        let zero_field = [
            ("port", self.port as u64),
            ("timeout_seconds", self.timeout_seconds),
            ("retry_attempts", self.retry_attempts as u64),
            ("buffer_size", self.buffer_size as u64),
            ("reconnect_delay_seconds", self.reconnect_delay_seconds),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        if let Some((name, _)) = zero_field {
            return Err(EngineError::Validation(format!("{name} must be positive")));
        }
        if self.buffer_size > MAX_BUFFER_SIZE {
            return Err(EngineError::Validation(format!(
                "buffer_size must not exceed {MAX_BUFFER_SIZE}"
            )));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub offset: f64,
    pub gain: f64,
    /// Low-pass coefficient α in [0, 1]. Accepts the legacy `filter` key on input.
    #[serde(alias = "filter")]
    pub filter_coefficient: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            offset: 0.0,
            gain: 1.0,
            filter_coefficient: 0.5,
        }
    }
}

impl CalibrationSettings {
    /// Gain as applied by the pipeline. A stored zero can only come from a
    /// hand-edited config file, so it is treated as unity here too.
    pub fn effective_gain(&self) -> f64 {
        if self.gain == 0.0 {
            1.0
        } else {
            self.gain
        }
    }

    pub fn effective_coefficient(&self) -> f64 {
        self.filter_coefficient.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnknownKey,
    InvalidValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedKey {
    pub key: String,
    pub reason: RejectReason,
}

/// Result of a partial update: the settings now in force plus every key that
/// was not applied.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome<T> {
    pub settings: T,
    pub rejected: Vec<RejectedKey>,
}

/// Shared owner of the two mutable configuration records.
///
/// Updates are staged on a copy and swapped in under a single write lock, so
/// a reader sees either the old record or the new one, never a mix.
pub struct SettingsStore {
    connection: RwLock<ConnectionSettings>,
    calibration: RwLock<CalibrationSettings>,
    reconnect_advised: AtomicBool,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(ConnectionSettings::default(), CalibrationSettings::default())
    }
}

impl SettingsStore {
    pub fn new(connection: ConnectionSettings, calibration: CalibrationSettings) -> Self {
        Self {
            connection: RwLock::new(connection),
            calibration: RwLock::new(calibration),
            reconnect_advised: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> ConnectionSettings {
        read(&self.connection).clone()
    }

    pub fn calibration(&self) -> CalibrationSettings {
        read(&self.calibration).clone()
    }

    /// Reads and clears the flag raised when host or port changed.
    pub fn take_reconnect_advised(&self) -> bool {
        self.reconnect_advised.swap(false, Ordering::SeqCst)
    }

    pub fn reconnect_advised(&self) -> bool {
        self.reconnect_advised.load(Ordering::SeqCst)
    }

    pub fn update_calibration(
        &self,
        partial: &Value,
    ) -> EngineResult<UpdateOutcome<CalibrationSettings>> {
        let fields = as_object(partial)?;
        let mut guard = write(&self.calibration);
        let mut next = guard.clone();
        let mut rejected = Vec::new();

        for (key, value) in fields {
            let applied = match key.as_str() {
                "offset" => assign(&mut next.offset, parse_f64(value)),
                "gain" => {
                    let gain = parse_f64(value).map(|gain| {
                        if gain == 0.0 {
                            warn!("Gain cannot be zero, setting to 1.0");
                            1.0
                        } else {
                            gain
                        }
                    });
                    assign(&mut next.gain, gain)
                }
                "filter_coefficient" | "filter" => assign(
                    &mut next.filter_coefficient,
                    parse_f64(value).map(|alpha| alpha.clamp(0.0, 1.0)),
                ),
                _ => {
                    warn!("Unknown calibration setting: {key}");
                    rejected.push(RejectedKey {
                        key: key.clone(),
                        reason: RejectReason::UnknownKey,
                    });
                    continue;
                }
            };

            if !applied {
                warn!("Ignoring invalid value for calibration setting {key}: {value}");
                rejected.push(RejectedKey {
                    key: key.clone(),
                    reason: RejectReason::InvalidValue,
                });
            }
        }

        *guard = next.clone();
        drop(guard);

        info!("Calibration settings updated: {next:?}");
        Ok(UpdateOutcome {
            settings: next,
            rejected,
        })
    }

    pub fn update_connection(
        &self,
        partial: &Value,
    ) -> EngineResult<UpdateOutcome<ConnectionSettings>> {
        let fields = as_object(partial)?;
        let mut guard = write(&self.connection);
        let mut next = guard.clone();
        let mut rejected = Vec::new();

        for (key, value) in fields {
            let applied = match key.as_str() {
                "host" => assign(
                    &mut next.host,
                    value
                        .as_str()
                        .map(str::trim)
                        .filter(|host| !host.is_empty())
                        .map(str::to_string),
                ),
                "port" => assign(
                    &mut next.port,
                    parse_positive(value).and_then(|port| u16::try_from(port).ok()),
                ),
                "timeout_seconds" | "timeout" => {
                    assign(&mut next.timeout_seconds, parse_positive(value))
                }
                "retry_attempts" => assign(
                    &mut next.retry_attempts,
                    parse_positive(value).and_then(|n| u32::try_from(n).ok()),
                ),
                "buffer_size" => assign(
                    &mut next.buffer_size,
                    parse_positive(value)
                        .and_then(|n| usize::try_from(n).ok())
                        .filter(|n| *n <= MAX_BUFFER_SIZE),
                ),
                "reconnect_delay_seconds" | "reconnect_delay" => {
                    assign(&mut next.reconnect_delay_seconds, parse_positive(value))
                }
                _ => {
                    warn!("Unknown connection setting: {key}");
                    rejected.push(RejectedKey {
                        key: key.clone(),
                        reason: RejectReason::UnknownKey,
                    });
                    continue;
                }
            };

            if !applied {
                warn!("Ignoring invalid value for connection setting {key}: {value}");
                rejected.push(RejectedKey {
                    key: key.clone(),
                    reason: RejectReason::InvalidValue,
                });
            }
        }

        let endpoint_changed = guard.host != next.host || guard.port != next.port;
        *guard = next.clone();
        drop(guard);

        if endpoint_changed {
            self.reconnect_advised.store(true, Ordering::SeqCst);
            info!("Host or port changed, reconnection advised");
        }

        info!("Connection settings updated: {next:?}");
        Ok(UpdateOutcome {
            settings: next,
            rejected,
        })
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn as_object(partial: &Value) -> EngineResult<&Map<String, Value>> {
    partial
        .as_object()
        .ok_or_else(|| EngineError::Validation("settings must be a JSON object".into()))
}

fn assign<T>(slot: &mut T, parsed: Option<T>) -> bool {
    match parsed {
        Some(value) => {
            *slot = value;
            true
        }
        None => false,
    }
}

fn parse_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Positive integer from a JSON number or numeric string. Integral floats
/// such as `5.0` are accepted; fractional ones are not.
fn parse_positive(value: &Value) -> Option<u64> {
    let parsed = match value {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 1.0 && *f <= u32::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.filter(|v| *v > 0)
}
