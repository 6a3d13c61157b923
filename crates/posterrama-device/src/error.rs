//! 设备与能力相关错误

pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device authentication failed: {0}")]
    Unauthorized(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Invalid value for {capability}: {reason}")]
    InvalidValue { capability: String, reason: String },

    #[error("Availability check failed: {0}")]
    Predicate(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeviceError {
    pub fn invalid(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            capability: capability.into(),
            reason: reason.into(),
        }
    }
}
