//! Error taxonomy for the capture core.
//!
//! Per-frame failures (`Timeout`, `ShortTransfer`, `DeviceError`) are
//! recovered inside the worker loop and only surface through the failed
//! buffer and the statistics counters. Start-time failures propagate to the
//! caller after the partially completed setup has been rolled back.

use thiserror::Error;

/// Convenience alias for results using the capture error type.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// Operation conflicts with the current state: format change while
    /// streaming, or a second stream on a shared-register device.
    #[error("device or channel busy")]
    Busy,

    #[error("frame sync edge did not arrive in time")]
    Timeout,

    #[error("stop requested while waiting")]
    Cancelled,

    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("DMA engine reported error {code}")]
    DeviceError { code: i32 },

    /// Internal invariant violation, e.g. a descriptor list shorter than a
    /// frame. Always an integration defect.
    #[error("internal fault: {0}")]
    Fault(&'static str),

    #[error("buffer too small: need {required} bytes, have {available}")]
    InvalidBuffer { required: usize, available: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no usable device: {0}")]
    NoDevice(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Raw failure code returned by the DMA engine primitive.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("engine error {0}")]
pub struct EngineError(pub i32);

impl From<EngineError> for CaptureError {
    fn from(e: EngineError) -> Self {
        CaptureError::DeviceError { code: e.0 }
    }
}
