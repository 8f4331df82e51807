//! Error taxonomy shared by the runtime, the assemblers and the drivers.

use std::fmt;
use thiserror::Error;

use crate::transport::TransportError;

/// Recoverable scan outcomes reported through `abort_scan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRetry {
    /// Swipe produced too few strips.
    TooShort,
    /// Generic retry (too fast, bad swipe).
    Retry,
    /// Finger was not centered on the sensor.
    CenterFinger,
    /// Device reported poor image quality.
    LowQuality,
    /// Device-side match failed.
    NoMatch,
    /// Finger must be lifted before the next attempt.
    RemoveFinger,
}

impl fmt::Display for ScanRetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanRetry::TooShort => write!(f, "too short"),
            ScanRetry::Retry => write!(f, "retry"),
            ScanRetry::CenterFinger => write!(f, "center finger"),
            ScanRetry::LowQuality => write!(f, "low quality"),
            ScanRetry::NoMatch => write!(f, "no match"),
            ScanRetry::RemoveFinger => write!(f, "remove finger"),
        }
    }
}

/// Errors that abort a state machine or surface through `session_error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FpError {
    #[error("USB transfer failed: {0}")]
    Transport(String),

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Transfer timed out")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Scan failed: {0}")]
    Capture(ScanRetry),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Resource unavailable: {0}")]
    Resource(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FpError {
    pub fn protocol(message: impl Into<String>) -> Self {
        FpError::Protocol(message.into())
    }

    /// True for deactivation-initiated termination.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FpError::Cancelled)
    }

    /// Capture errors restart the scan loop instead of ending the session.
    pub fn scan_retry(&self) -> Option<ScanRetry> {
        match self {
            FpError::Capture(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<TransportError> for FpError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { .. } => FpError::Timeout,
            TransportError::SlotBusy => FpError::Resource(err.to_string()),
            other => FpError::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FpError>;
