//! Custom error types for the driver.
//!
//! `SynthError` consolidates the failure modes of the serial engine. The
//! important split is between transient link failures (worth a reconnect)
//! and everything else: background workers recover from retryable errors on
//! their own, while parse and configuration errors abandon only the current
//! operation. The one error callers must handle is `NotDetected`, raised by
//! the bounded connect so a host can fall back to another speech output.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type Result<T> = std::result::Result<T, SynthError>;

#[derive(Error, Debug)]
pub enum SynthError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Serial port not connected")]
    NotConnected,

    #[error("Serial write timed out")]
    WriteTimeout,

    #[error("Apollo not detected (port={port}, baud={baud})")]
    NotDetected { port: String, baud: u32 },

    #[error("Malformed device response: {0}")]
    MalformedResponse(String),

    #[error("Response timed out")]
    ResponseTimeout,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Driver is shutting down")]
    ShuttingDown,
}

impl SynthError {
    /// Whether a disconnect/reconnect cycle can be expected to clear the error.
    ///
    /// Parse and configuration errors are not retryable: resending the same
    /// bytes would fail the same way.
    pub fn is_retryable(&self) -> bool {
        match self {
            SynthError::Io(_)
            | SynthError::Serial(_)
            | SynthError::NotConnected
            | SynthError::WriteTimeout
            | SynthError::ResponseTimeout => true,
            SynthError::NotDetected { .. }
            | SynthError::MalformedResponse(_)
            | SynthError::Config(_)
            | SynthError::Configuration(_)
            | SynthError::ShuttingDown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_retryable() {
        let err = SynthError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "tx"));
        assert!(err.is_retryable());
        assert!(SynthError::WriteTimeout.is_retryable());
    }

    #[test]
    fn parse_errors_are_not_retryable() {
        let err = SynthError::MalformedResponse("expected 2 hex digits".into());
        assert!(!err.is_retryable());
        let err = SynthError::NotDetected {
            port: "COM3".into(),
            baud: 9600,
        };
        assert!(!err.is_retryable());
    }
}
