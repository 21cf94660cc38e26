use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// No usable format or an invalid configuration; a contract violation
    /// when raised by the negotiator.
    #[error("Configuration invalid: {reason}")]
    Configuration { reason: String },

    #[error("No usable capture input device")]
    NoInputDevice,

    #[error("Capture session interrupted: {reason}")]
    Interrupted { reason: String },

    #[error("Capture backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CaptureError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration { reason: reason.into() }
    }

    /// Whether the failure invalidates the platform session outright.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}
