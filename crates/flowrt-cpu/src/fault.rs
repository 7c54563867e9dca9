//! Fault injection for driver operations.

use std::collections::HashMap;
use std::fmt;

use flowrt_device::error::{DeviceError, DeviceResult};
use parking_lot::Mutex;

/// Driver operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    /// `mem_alloc`.
    MemAlloc,
    /// `mem_free`.
    MemFree,
    /// `stream_create`.
    StreamCreate,
    /// `stream_destroy`.
    StreamDestroy,
    /// `stream_synchronize`.
    StreamSynchronize,
    /// `memcpy_async` (rejected at enqueue).
    MemcpyAsync,
    /// A copy that was accepted but fails when it executes on the stream.
    CopyExecution,
    /// `event_create`.
    EventCreate,
    /// `event_destroy`.
    EventDestroy,
    /// `event_record`.
    EventRecord,
    /// `event_query`.
    EventQuery,
    /// `event_synchronize`.
    EventSynchronize,
}

impl DriverOp {
    /// Operation name as used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::MemAlloc => "mem_alloc",
            Self::MemFree => "mem_free",
            Self::StreamCreate => "stream_create",
            Self::StreamDestroy => "stream_destroy",
            Self::StreamSynchronize => "stream_synchronize",
            Self::MemcpyAsync => "memcpy_async",
            Self::CopyExecution => "copy_execution",
            Self::EventCreate => "event_create",
            Self::EventDestroy => "event_destroy",
            Self::EventRecord => "event_record",
            Self::EventQuery => "event_query",
            Self::EventSynchronize => "event_synchronize",
        }
    }
}

impl fmt::Display for DriverOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Remaining injected failures per operation.
#[derive(Debug, Default)]
pub(crate) struct FaultInjector {
    remaining: Mutex<HashMap<DriverOp, usize>>,
}

impl FaultInjector {
    pub(crate) fn inject(&self, op: DriverOp, count: usize) {
        *self.remaining.lock().entry(op).or_default() += count;
    }

    pub(crate) fn remaining(&self, op: DriverOp) -> usize {
        self.remaining.lock().get(&op).copied().unwrap_or(0)
    }

    pub(crate) fn clear(&self) {
        self.remaining.lock().clear();
    }

    /// Consume one injected failure of `op`, if any.
    pub(crate) fn check(&self, op: DriverOp) -> DeviceResult<()> {
        let mut remaining = self.remaining.lock();
        match remaining.get_mut(&op) {
            Some(count) if *count > 0 => {
                *count -= 1;
                tracing::debug!(op = op.name(), left = *count, "Injecting driver fault");
                Err(DeviceError::Injected(op.name()))
            }
            _ => Ok(()),
        }
    }
}
