use thiserror::Error;

/// Failure classes of the acquisition engine.
///
/// Each variant is isolated to the unit of work that produced it: a sample,
/// a command or a connection attempt. Only retry exhaustion changes the
/// engine's mode, and that is reported through `is_demo_data`, not here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Timeout, refusal or reset on the instrument socket.
    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("invalid settings: {0}")]
    Validation(String),

    /// Zero-length payload. On the socket this means the peer closed.
    #[error("empty payload")]
    EmptyPayload,

    #[error("could not decode payload: {0}")]
    ProtocolDecode(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable discriminator sent to clients in `error` replies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::TransientNetwork(_) => "transient_network",
            EngineError::Validation(_) => "validation",
            EngineError::EmptyPayload => "empty_payload",
            EngineError::ProtocolDecode(_) => "protocol_decode",
            EngineError::PermissionDenied(_) => "permission_denied",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::TransientNetwork(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
