//! Error types for flowrt.
//!
//! Every public entry point returns either a value, a deferred
//! [`AsyncValueRef`](crate::async_value::AsyncValueRef) or a [`FlowError`]
//! naming the stage that failed.

use thiserror::Error;

/// Result type for flowrt operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Coarse classification of a [`FlowError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Host or device memory could not be allocated.
    Allocation,
    /// The driver rejected a copy or marker operation.
    Enqueue,
    /// Waiting on a completion marker failed.
    Synchronization,
    /// The host executor refused a task or a request.
    Submission,
    /// Terminal state installed by cancelling a request.
    Cancelled,
    /// Invalid configuration.
    Config,
    /// Raw driver error surfaced outside the transfer pipeline.
    Device,
    /// A host task panicked before producing its result.
    Panicked,
}

/// Errors produced by the transfer engine.
///
/// `FlowError` is `Clone` because it is stored inside completion values and
/// handed to every holder that inspects them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// Allocation failed.
    #[error("Allocation of {size} bytes failed: {reason}")]
    AllocationFailed {
        /// Requested size in bytes.
        size: usize,
        /// Failure reason.
        reason: String,
    },

    /// Not enough memory left in an arena.
    #[error("Out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Requested size in bytes.
        requested: usize,
        /// Bytes still available.
        available: usize,
    },

    /// A copy or marker operation could not be enqueued.
    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    /// Waiting on a completion marker failed.
    #[error("Synchronization failed: {0}")]
    SyncFailed(String),

    /// The executor rejected a task.
    #[error("Submission rejected: {0}")]
    SubmissionRejected(String),

    /// The executor refused to register a request.
    #[error("Request rejected: {0}")]
    RequestRejected(String),

    /// The request was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A driver call failed outside the transfer pipeline.
    #[error("Device error: {0}")]
    Device(String),

    /// A blocking task panicked before resolving its result.
    #[error("Task panicked: {0}")]
    TaskPanicked(String),
}

impl FlowError {
    /// Create an allocation error.
    pub fn allocation(size: usize, reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            size,
            reason: reason.into(),
        }
    }

    /// Create an enqueue error.
    pub fn enqueue(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    /// Create a synchronization error.
    pub fn sync(msg: impl Into<String>) -> Self {
        Self::SyncFailed(msg.into())
    }

    /// Create a submission error.
    pub fn submission(msg: impl Into<String>) -> Self {
        Self::SubmissionRejected(msg.into())
    }

    /// Create a request rejection error.
    pub fn request_rejected(msg: impl Into<String>) -> Self {
        Self::RequestRejected(msg.into())
    }

    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a device error.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Create a task panic error.
    pub fn panicked(msg: impl Into<String>) -> Self {
        Self::TaskPanicked(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AllocationFailed { .. } | Self::OutOfMemory { .. } => ErrorKind::Allocation,
            Self::EnqueueFailed(_) => ErrorKind::Enqueue,
            Self::SyncFailed(_) => ErrorKind::Synchronization,
            Self::SubmissionRejected(_) | Self::RequestRejected(_) => ErrorKind::Submission,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidConfig(_) => ErrorKind::Config,
            Self::Device(_) => ErrorKind::Device,
            Self::TaskPanicked(_) => ErrorKind::Panicked,
        }
    }

    /// Check if this error is the cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(FlowError::allocation(16, "no host memory").kind(), ErrorKind::Allocation);
        assert_eq!(
            FlowError::OutOfMemory {
                requested: 32,
                available: 0
            }
            .kind(),
            ErrorKind::Allocation
        );
        assert_eq!(FlowError::enqueue("bad stream").kind(), ErrorKind::Enqueue);
        assert_eq!(FlowError::sync("lost device").kind(), ErrorKind::Synchronization);
        assert_eq!(FlowError::submission("queue full").kind(), ErrorKind::Submission);
        assert_eq!(FlowError::request_rejected("limit").kind(), ErrorKind::Submission);
        assert_eq!(FlowError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(FlowError::config("zero workers").kind(), ErrorKind::Config);
        assert_eq!(FlowError::device("stream destroyed").kind(), ErrorKind::Device);
        assert_eq!(FlowError::panicked("boom").kind(), ErrorKind::Panicked);
    }

    #[test]
    fn test_error_display() {
        let err = FlowError::allocation(64, "cannot allocate result tensor");
        assert_eq!(
            err.to_string(),
            "Allocation of 64 bytes failed: cannot allocate result tensor"
        );
        assert_eq!(FlowError::Cancelled.to_string(), "Cancelled");
        assert!(FlowError::Cancelled.is_cancelled());
        assert!(!FlowError::sync("x").is_cancelled());
    }
}
