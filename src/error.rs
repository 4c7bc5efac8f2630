//! Error types for capture operations.
//!
//! Every failure the capture path can produce maps onto one [`CaptureError`]
//! variant. The variants follow the lifecycle: device open, negotiation,
//! pool allocation and mapping, stream control, per-frame I/O and teardown.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::controller::SessionState;

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Errors that can occur while acquiring frames.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Device path could not be validated or opened.
    #[error("Device error on '{}': {message}", path.display())]
    Device {
        /// Path that was being opened.
        path: PathBuf,
        /// Reason reported by the OS or the validation step.
        message: String,
    },

    /// Format or frame-rate negotiation was refused by the driver.
    #[error("Capability negotiation refused: {0}")]
    Capability(String),

    /// Not enough buffers granted, or heap memory exhausted.
    #[error("Buffer allocation failed: {0}")]
    Allocation(String),

    /// A buffer could not be mapped or registered.
    #[error("Buffer {index} mapping failed: {message}")]
    Mapping {
        /// Pool index of the failing buffer.
        index: u32,
        /// Reason for the failure.
        message: String,
    },

    /// Enqueue-all, stream-on or stream-off failed.
    #[error("Stream control failed: {0}")]
    StreamControl(String),

    /// The device had no buffer ready (EAGAIN).
    #[error("Device not ready")]
    TransientIo,

    /// Hard I/O failure on dequeue or readiness wait.
    #[error("Fatal I/O error: {0}")]
    FatalIo(io::Error),

    /// A buffer could not be released during teardown.
    #[error("Buffer {index} release failed: {message}")]
    Release {
        /// Pool index of the failing buffer.
        index: u32,
        /// Reason for the failure.
        message: String,
    },

    /// Extension unit control query failed.
    #[error("Extension unit control query failed: {0}")]
    Control(String),

    /// An operation was invoked in a state that does not allow it.
    #[error("'{operation}' is not allowed in state {state}")]
    ContractViolation {
        /// Operation that was attempted.
        operation: &'static str,
        /// Session state at the time of the call.
        state: SessionState,
    },

    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// Classify a failed dequeue/enqueue errno as transient or fatal.
    pub fn from_queue_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::WouldBlock {
            Self::TransientIo
        } else {
            Self::FatalIo(err)
        }
    }

    /// Whether the acquisition loop may continue after this error.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo)
    }
}
