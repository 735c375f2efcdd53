use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::settings::{CalibrationSettings, SettingsStore};

/// Carried-over low-pass state. Each pipeline owns exactly one.
#[derive(Debug, Clone, Default)]
pub struct FilterState {
    last_filtered_value: Option<f64>,
}

impl FilterState {
    pub fn last(&self) -> Option<f64> {
        self.last_filtered_value
    }

    pub fn reset(&mut self) {
        self.last_filtered_value = None;
    }

    /// First call passes the value through; later calls blend with α.
    pub fn step(&mut self, calibrated: f64, alpha: f64) -> f64 {
        let filtered = match self.last_filtered_value {
            Some(previous) => alpha * calibrated + (1.0 - alpha) * previous,
            None => calibrated,
        };
        self.last_filtered_value = Some(filtered);
        filtered
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub raw_value: f64,
    pub calibrated_value: f64,
    pub filtered_value: f64,
    /// Calibration that produced this reading.
    pub calibration: CalibrationSettings,
}

/// Placeholder decoding: the mean of the payload's byte values.
pub fn decode_raw(bytes: &[u8]) -> EngineResult<f64> {
    if bytes.is_empty() {
        return Err(EngineError::EmptyPayload);
    }
    let sum: u64 = bytes.iter().map(|b| *b as u64).sum();
    Ok(sum as f64 / bytes.len() as f64)
}

pub fn calibrate(raw: f64, calibration: &CalibrationSettings) -> f64 {
    (raw + calibration.offset) * calibration.effective_gain()
}

/// Calibration + exponential smoothing over one stream of readings.
///
/// Calibration is read from the store on every call, so an update applies
/// from the next reading on.
pub struct FilterPipeline {
    settings: Arc<SettingsStore>,
    state: FilterState,
}

impl FilterPipeline {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self {
            settings,
            state: FilterState::default(),
        }
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    pub fn process_bytes(&mut self, bytes: &[u8]) -> EngineResult<Reading> {
        let raw = decode_raw(bytes)?;
        self.process_value(raw)
    }

    pub fn process_value(&mut self, raw: f64) -> EngineResult<Reading> {
        let calibration = self.settings.calibration();
        let calibrated = calibrate(raw, &calibration);
        if !calibrated.is_finite() {
            return Err(EngineError::ProtocolDecode(format!(
                "calibrated value is not finite (raw={raw})"
            )));
        }

        let filtered = self
            .state
            .step(calibrated, calibration.effective_coefficient());

        Ok(Reading {
            raw_value: raw,
            calibrated_value: calibrated,
            filtered_value: filtered,
            calibration,
        })
    }
}
