//! Driver error types.

use flowrt_core::error::FlowError;
use thiserror::Error;

/// Result type for driver operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors reported by a [`DeviceDriver`](crate::driver::DeviceDriver).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device could not satisfy an allocation.
    #[error("Out of device memory: requested {requested} bytes")]
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
    },

    /// A pointer or range does not lie inside a live allocation.
    #[error("Invalid device pointer {addr:#x} (+{len} bytes)")]
    InvalidPointer {
        /// Start address.
        addr: usize,
        /// Length of the accessed range.
        len: usize,
    },

    /// Unknown or destroyed stream.
    #[error("Invalid stream: {0}")]
    InvalidStream(u64),

    /// Unknown or destroyed event.
    #[error("Invalid event: {0}")]
    InvalidEvent(u64),

    /// The event was already recorded.
    #[error("Event {0} already recorded")]
    EventAlreadyRecorded(u64),

    /// Earlier work on the stream failed; the stream stays failed.
    #[error("Stream {stream} failed: {reason}")]
    StreamFailed {
        /// Stream id.
        stream: u64,
        /// First failure observed on the stream.
        reason: String,
    },

    /// A fault injected for testing.
    #[error("Injected fault in {0}")]
    Injected(&'static str),

    /// Any other driver failure.
    #[error("Driver error: {0}")]
    Driver(String),
}

impl DeviceError {
    /// Create a generic driver error.
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }
}

impl From<DeviceError> for FlowError {
    fn from(err: DeviceError) -> Self {
        FlowError::device(err.to_string())
    }
}
