//! Stream worker threads.
//!
//! Each simulated stream is a thread draining a FIFO of operations. The first
//! copy that fails leaves the stream in a sticky error state: later copies
//! are skipped and later markers complete with that error.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use flowrt_core::async_value::AsyncValueRef;
use flowrt_core::error::FlowError;
use flowrt_device::driver::Pointer;
use flowrt_device::error::{DeviceError, DeviceResult};
use tracing::{debug, warn};

use crate::driver::DriverShared;
use crate::fault::DriverOp;

/// Completion of a marker or barrier.
pub(crate) type Completion = AsyncValueRef<()>;

pub(crate) enum StreamOp {
    Copy {
        dst: Pointer,
        src: Pointer,
        size: usize,
    },
    /// Resolves once everything queued before it has executed.
    Record(Completion),
}

pub(crate) struct StreamWorker {
    id: u64,
    tx: Option<Sender<StreamOp>>,
    thread: Option<JoinHandle<()>>,
}

impl StreamWorker {
    pub(crate) fn spawn(id: u64, shared: Arc<DriverShared>) -> DeviceResult<Self> {
        let (tx, rx) = channel::unbounded();
        let thread = std::thread::Builder::new()
            .name(format!("flowrt-cpu-stream-{id}"))
            .spawn(move || run(id, rx, shared))
            .map_err(|e| DeviceError::driver(format!("cannot spawn stream thread: {e}")))?;
        Ok(Self {
            id,
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    pub(crate) fn submit(&self, op: StreamOp) -> DeviceResult<()> {
        match &self.tx {
            Some(tx) => tx
                .send(op)
                .map_err(|_| DeviceError::InvalidStream(self.id)),
            None => Err(DeviceError::InvalidStream(self.id)),
        }
    }

    /// Queue a marker and return its completion.
    pub(crate) fn record(&self) -> DeviceResult<Completion> {
        let completion = Completion::unresolved();
        self.submit(StreamOp::Record(completion.clone()))?;
        Ok(completion)
    }

    /// Let queued work finish, then stop the thread.
    pub(crate) fn shutdown(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(stream = self.id, "Stream thread panicked");
            }
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(id: u64, rx: Receiver<StreamOp>, shared: Arc<DriverShared>) {
    let mut sticky: Option<String> = None;

    while let Ok(op) = rx.recv() {
        match op {
            StreamOp::Copy { dst, src, size } => {
                if sticky.is_some() {
                    continue;
                }
                if let Some(latency) = shared.config.copy_latency {
                    std::thread::sleep(latency);
                }
                match execute_copy(&shared, dst, src, size) {
                    Ok(()) => {
                        shared.stats.copies.fetch_add(1, Ordering::Relaxed);
                        shared
                            .stats
                            .bytes_copied
                            .fetch_add(size as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(stream = id, error = %e, "Copy failed; stream is now in error");
                        sticky = Some(e.to_string());
                    }
                }
            }
            StreamOp::Record(completion) => {
                match &sticky {
                    None => completion.set_value(()),
                    Some(reason) => completion.set_error(FlowError::device(reason.clone())),
                };
            }
        }
    }

    debug!(stream = id, "Stream thread exiting");
}

fn execute_copy(shared: &DriverShared, dst: Pointer, src: Pointer, size: usize) -> DeviceResult<()> {
    shared.faults.check(DriverOp::CopyExecution)?;
    if size == 0 {
        return Ok(());
    }

    let mut staging = vec![0u8; size];
    match src {
        Pointer::Device(ptr) => shared.memory.read(ptr, &mut staging)?,
        // SAFETY: `memcpy_async` callers keep host ranges valid until the
        // copy has executed.
        Pointer::Host(addr) => unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, staging.as_mut_ptr(), size)
        },
    }
    match dst {
        Pointer::Device(ptr) => shared.memory.write(ptr, &staging)?,
        // SAFETY: as above, and the destination is not accessed by anyone
        // else until the copy has executed.
        Pointer::Host(addr) => unsafe {
            std::ptr::copy_nonoverlapping(staging.as_ptr(), addr as *mut u8, size)
        },
    }
    Ok(())
}
