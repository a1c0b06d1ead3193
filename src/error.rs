use std::time::Duration;

/// Failures of a single host-level action. Bounds and malformed-action
/// errors fail that one action; timeouts are retried by the executor before
/// failing it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("screen capture failed: {0}")]
    Capture(String),

    #[error("screen capture timed out after {0:?}")]
    CaptureTimeout(Duration),

    #[error("coordinates ({x}, {y}) outside screen bounds {width}x{height}")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },

    #[error("input synthesis failed: {0}")]
    Input(String),

    #[error("input synthesis timed out after {0:?}")]
    InputTimeout(Duration),

    #[error("text contains control characters; express them as key presses instead")]
    ControlCharacters,

    #[error("invalid key chord {0:?}: expected a single chord like ctrl+shift+t")]
    BadKeyChord(String),
}

impl ActionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CaptureTimeout(_) | Self::InputTimeout(_))
    }
}

/// Failures of the model boundary. All variants are retried with backoff up
/// to the brain's attempt budget; exhausting the budget fails the session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("model API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("model call timed out after {0:?}")]
    CallTimeout(Duration),

    #[error("malformed model response: {0}")]
    Response(String),

    #[error("model transport error: {0}")]
    Transport(String),
}
