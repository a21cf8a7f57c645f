//! Error type shared by the buffer ring, the capture device and the command protocol.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::traits::{DeviceState, FourCC};

/// Error type for handler operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The device node could not be opened or is not a streaming capture device.
    #[error("device {path} unavailable: {source}")]
    DeviceUnavailable {
        /// Path of the device node.
        path: PathBuf,
        /// Underlying open/query failure.
        #[source]
        source: io::Error,
    },

    /// No usable capture format could be negotiated.
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),

    /// Fewer buffers than double-buffering needs were requested or granted.
    #[error("insufficient buffers: requested {requested}, granted {granted}")]
    InsufficientBuffers {
        /// Number of buffers asked for.
        requested: u32,
        /// Number of buffers the hardware handed out.
        granted: u32,
    },

    /// A buffer could not be mapped into the process.
    #[error("failed to map buffer {index}: {reason}")]
    AllocationFailed {
        /// Buffer index.
        index: u32,
        /// Why mapping failed.
        reason: String,
    },

    /// The device reported no filled buffer.
    #[error("no frame available")]
    NoDataAvailable,

    /// The bounded wait for a filled buffer elapsed.
    #[error("timed out waiting for a frame")]
    Timeout,

    /// Hardware-level failure during a buffer or streaming operation.
    #[error("device error: {0}")]
    DeviceError(#[source] io::Error),

    /// The active pixel encoding has no defined interpretation.
    #[error("unsupported pixel encoding {0}")]
    UnsupportedEncoding(FourCC),

    /// A raw frame did not have the size its dimensions require.
    #[error("bad input length: expected {expected} bytes, got {actual}")]
    BadInputLength {
        /// Required number of bytes.
        expected: usize,
        /// Number of bytes supplied.
        actual: usize,
    },

    /// The device reported an undefined frame interval.
    #[error("frame rate unavailable: device reported {numerator}/{denominator}")]
    RateUnavailable {
        /// Reported interval numerator.
        numerator: u32,
        /// Reported interval denominator.
        denominator: u32,
    },

    /// Operation is not valid in the device's current state.
    #[error("operation not valid while device is {0:?}")]
    InvalidState(DeviceState),

    /// A buffer handle was returned to a ring that did not issue it.
    #[error("buffer handle does not belong to this ring")]
    ForeignHandle,

    /// A command is already in flight.
    #[error("a command is already in flight")]
    Busy,

    /// A command payload could not be decoded.
    #[error("invalid payload for {command}: {reason}")]
    InvalidPayload {
        /// Name of the command the payload was meant for.
        command: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// Unknown command identifier.
    #[error("unknown command id 0x{0:02x}")]
    UnknownCommand(u8),

    /// Unknown parameter identifier.
    #[error("unknown parameter id 0x{0:02x}")]
    UnknownParameter(u8),

    /// The capture worker is not running.
    #[error("capture worker is not running")]
    WorkerGone,

    /// A frame failed pattern or artifact validation.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Invalid handler configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error outside the hardware path (snapshot files, config files).
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CameraError {
    /// Stable numeric code reported with failed command results.
    pub const fn code(&self) -> u8 {
        match self {
            Self::DeviceUnavailable { .. } => 0x01,
            Self::FormatNegotiationFailed(_) => 0x02,
            Self::InsufficientBuffers { .. } => 0x03,
            Self::AllocationFailed { .. } => 0x04,
            Self::NoDataAvailable => 0x10,
            Self::Timeout => 0x11,
            Self::DeviceError(_) => 0x12,
            Self::UnsupportedEncoding(_) => 0x20,
            Self::BadInputLength { .. } => 0x21,
            Self::RateUnavailable { .. } => 0x22,
            Self::InvalidState(_) => 0x30,
            Self::ForeignHandle => 0x31,
            Self::Busy => 0x40,
            Self::InvalidPayload { .. } => 0x41,
            Self::UnknownCommand(_) => 0x42,
            Self::UnknownParameter(_) => 0x43,
            Self::WorkerGone => 0x44,
            Self::ValidationFailed(_) => 0x50,
            Self::Config(_) => 0x60,
            Self::Io(_) => 0x70,
        }
    }

    /// Map a hardware dequeue failure onto the transient/fatal split.
    pub(crate) fn from_dequeue(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Self::NoDataAvailable,
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::DeviceError(err),
        }
    }
}

/// Result type for handler operations.
pub type Result<T> = std::result::Result<T, CameraError>;
