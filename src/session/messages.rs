use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::link::ConnectionState;
use crate::pipeline::{epoch_seconds, AdminSnapshot, Sample};
use crate::settings::{CalibrationSettings, ConnectionSettings, RejectedKey};

use super::role::Role;

/// A client command after JSON decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub action: String,
    pub parameters: Option<Value>,
    pub command: Option<String>,
}

/// Why an inbound frame could not be turned into a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundError {
    InvalidJson,
    MissingAction,
}

impl InboundError {
    pub fn message(&self) -> &'static str {
        match self {
            InboundError::InvalidJson => "Invalid JSON format",
            InboundError::MissingAction => "No action specified",
        }
    }
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        let value: Value = serde_json::from_str(text).map_err(|_| InboundError::InvalidJson)?;
        let object = value.as_object().ok_or(InboundError::MissingAction)?;

        let action = object
            .get("action")
            .and_then(Value::as_str)
            .filter(|action| !action.is_empty())
            .ok_or(InboundError::MissingAction)?;

        Ok(Self {
            action: action.to_string(),
            parameters: object.get("parameters").filter(|p| !p.is_null()).cloned(),
            command: object
                .get("command")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    Validation,
    UnknownAction,
    Malformed,
    Internal,
    Rejected,
}

/// Everything the server sends to a client, tagged by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    ConnectionEstablished {
        user: String,
        role: Role,
        session_id: Uuid,
    },
    Data {
        data: SampleView,
    },
    Status(StatusView),
    Error {
        error: String,
        kind: ErrorKind,
    },
    Response {
        action: String,
        success: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        settings: Option<Value>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        rejected: Vec<RejectedKey>,
    },
}

impl Outbound {
    pub fn error(kind: ErrorKind, error: impl Into<String>) -> Self {
        Outbound::Error {
            error: error.into(),
            kind,
        }
    }

    pub fn ack(action: impl Into<String>, message: impl Into<String>) -> Self {
        Outbound::Response {
            action: action.into(),
            success: true,
            message: message.into(),
            settings: None,
            rejected: Vec::new(),
        }
    }

    pub fn failure(action: impl Into<String>, message: impl Into<String>) -> Self {
        Outbound::Response {
            action: action.into(),
            success: false,
            message: message.into(),
            settings: None,
            rejected: Vec::new(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Outbound::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Calibration block as clients see it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationView {
    pub offset: f64,
    pub gain: f64,
    pub filter: f64,
}

impl From<&CalibrationSettings> for CalibrationView {
    fn from(settings: &CalibrationSettings) -> Self {
        Self {
            offset: settings.offset,
            gain: settings.gain,
            filter: settings.filter_coefficient,
        }
    }
}

/// Connection block trimmed to what a role may see. `None` fields are left
/// out of the JSON entirely; `Some(None)` is sent as `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionView {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<Option<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<ConnectionSettings>,
}

impl ConnectionView {
    fn build(
        state: &ConnectionState,
        settings: &ConnectionSettings,
        role: Role,
        always_last_connected: bool,
    ) -> Self {
        let calibrator = role >= Role::Calibrator;
        let admin = role >= Role::Admin;
        let last_connected = state.last_connected_at.map(epoch_seconds);

        Self {
            connected: state.connected,
            last_connected: (calibrator || always_last_connected).then_some(last_connected),
            reconnect_attempts: calibrator.then_some(state.reconnect_attempts),
            last_error: admin.then(|| state.last_error.clone()),
            settings: admin.then(|| settings.clone()),
        }
    }
}

/// Role-filtered copy of a [`Sample`], built per subscriber at send time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleView {
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<f64>,
    pub calibrated_value: f64,
    pub filtered_value: f64,
    pub is_demo_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration_data: Option<CalibrationView>,
    pub connection_state: ConnectionView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_data: Option<AdminSnapshot>,
}

impl SampleView {
    pub fn for_role(sample: &Sample, role: Role) -> Self {
        let calibrator = role >= Role::Calibrator;
        let admin = role >= Role::Admin;

        Self {
            timestamp: epoch_seconds(sample.timestamp),
            raw_value: calibrator.then_some(sample.raw_value),
            calibrated_value: sample.calibrated_value,
            filtered_value: sample.filtered_value,
            is_demo_data: sample.is_demo_data,
            calibration_data: calibrator.then(|| CalibrationView::from(&sample.calibration)),
            connection_state: ConnectionView::build(
                &sample.connection,
                &sample.connection_settings,
                role,
                false,
            ),
            admin_data: admin.then(|| sample.admin.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub timestamp: f64,
    pub connection: ConnectionView,
    pub demo_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationView>,
}

impl StatusView {
    pub fn for_role(
        state: &ConnectionState,
        connection: &ConnectionSettings,
        calibration: &CalibrationSettings,
        role: Role,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: epoch_seconds(at),
            connection: ConnectionView::build(state, connection, role, true),
            demo_mode: state.is_demo(),
            calibration: (role >= Role::Calibrator).then(|| CalibrationView::from(calibration)),
        }
    }
}

/// WebSocket close codes used by the session layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    Unauthenticated,
    InternalError,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::Unauthenticated => 4001,
            CloseReason::InternalError => 4002,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal closure",
            CloseReason::Unauthenticated => "authentication required",
            CloseReason::InternalError => "internal server error",
        }
    }
}
