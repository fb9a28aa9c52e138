//! Error types for weft.
//!
//! Cursor alerts are the one *recoverable* error kind: they are stored in a
//! sequence's alert slot and re-raised by every barrier that follows it, so
//! the error type is `Clone`. Everything else (invariant violations, fiber
//! panics) is surfaced as a panic at the offending call site.

use thiserror::Error;

/// Result type alias for weft operations.
pub type Result<T> = std::result::Result<T, WeftError>;

/// Main error type for the weft runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// A producer finished its stream; downstream consumers may drain
    /// everything published before the mark and then stop.
    #[error("end of stream")]
    Eof,

    /// A cursor was poisoned with an out-of-band error.
    #[error("cursor alerted: {message}")]
    Alerted { message: String },

    /// The strand was cancelled; further posts are refused.
    #[error("strand cancelled")]
    Cancelled,

    /// Invalid configuration parameter.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Logic error in a correctly functioning system.
    #[error("unexpected error: {message}")]
    Unexpected { message: String },
}

impl WeftError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    pub fn alert(message: impl Into<String>) -> Self {
        Self::Alerted { message: message.into() }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected { message: message.into() }
    }

    /// True for the alert family that flows through barriers and can be
    /// handled by draining consumers; false for programming errors.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Eof | Self::Alerted { .. } | Self::Cancelled)
    }
}
