//! The closed error taxonomy shared by every component.
//!
//! Each variant maps to a stable `kind()` string that appears unchanged in
//! control-plane error responses and in logs. Raw OS error text stays in
//! the `detail` position and never becomes a kind of its own.

use thiserror::Error;

/// Core error, one variant per observable failure class.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown service, package, or configuration key.
    #[error("not found: {0}")]
    NotFound(String),

    /// The OS refused a capability call.
    #[error("denied: {0}")]
    Denied(String),

    /// An operation exceeded its time budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation does not apply in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The underlying OS facility is absent.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Socket or file I/O failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed command, response, or persisted data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Unexpected condition; the operation was aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable kind string for the control protocol and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Denied(_) => "denied",
            Self::Timeout(_) => "timeout",
            Self::InvalidState(_) => "invalid_state",
            Self::CapabilityUnavailable(_) => "capability_unavailable",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Internal(_) => "internal",
        }
    }

    /// Detail message without the kind prefix.
    pub fn detail(&self) -> &str {
        match self {
            Self::NotFound(s)
            | Self::Denied(s)
            | Self::Timeout(s)
            | Self::InvalidState(s)
            | Self::CapabilityUnavailable(s)
            | Self::Transport(s)
            | Self::Protocol(s)
            | Self::Internal(s) => s,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
