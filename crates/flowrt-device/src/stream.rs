//! Owning stream and event handles.

use std::fmt;

use flowrt_core::error::FlowError;
use tracing::{error, warn};

use crate::driver::{CurrentContext, Event, Stream};
use crate::error::DeviceResult;

/// A stream destroyed when dropped.
pub struct OwningStream {
    ctx: CurrentContext,
    stream: Stream,
}

impl OwningStream {
    pub(crate) fn new(ctx: CurrentContext, stream: Stream) -> Self {
        Self { ctx, stream }
    }

    /// The stream handle.
    pub fn get(&self) -> Stream {
        self.stream
    }

    /// Block until all work queued on the stream has finished.
    pub fn synchronize(&self) -> DeviceResult<()> {
        self.ctx.stream_synchronize(self.stream)
    }
}

impl Drop for OwningStream {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.driver().stream_destroy(self.stream) {
            warn!(stream = %self.stream, error = %e, "Failed to destroy stream");
        }
    }
}

impl fmt::Debug for OwningStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwningStream").field(&self.stream).finish()
    }
}

/// An event destroyed when dropped.
pub struct OwningEvent {
    ctx: CurrentContext,
    event: Event,
}

impl OwningEvent {
    pub(crate) fn new(ctx: CurrentContext, event: Event) -> Self {
        Self { ctx, event }
    }

    /// The event handle.
    pub fn get(&self) -> Event {
        self.event
    }

    /// Record the event after everything currently queued on `stream`.
    pub fn record(&self, stream: Stream) -> DeviceResult<()> {
        self.ctx.driver().event_record(self.event, stream)
    }

    /// Check whether the captured work has completed.
    pub fn query(&self) -> DeviceResult<bool> {
        self.ctx.driver().event_query(self.event)
    }

    /// Block until the captured work has completed.
    pub fn synchronize(&self) -> DeviceResult<()> {
        self.ctx.driver().event_synchronize(self.event)
    }
}

impl Drop for OwningEvent {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.driver().event_destroy(self.event) {
            warn!(event = %self.event, error = %e, "Failed to destroy event");
        }
    }
}

impl fmt::Debug for OwningEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwningEvent").field(&self.event).finish()
    }
}

/// Wait for all work on `stream`, then release `payload`.
///
/// If the stream cannot be drained the payload is leaked: it may still be
/// the source or destination of an in-flight copy.
pub(crate) fn release_after_drain<T>(ctx: &CurrentContext, stream: Stream, payload: T) {
    match ctx.stream_synchronize(stream) {
        Ok(()) => drop(payload),
        Err(e) => {
            error!(
                stream = %stream,
                error = %e,
                "Cannot drain stream; leaking memory still visible to the device"
            );
            std::mem::forget(payload);
        }
    }
}

/// Keeps `payload` alive until a recorded event has completed.
///
/// [`wait`](Self::wait) hands the payload back once the event completes.
/// Dropping the guard without waiting performs the same wait before the
/// payload is released, so memory referenced by in-flight device work is
/// never freed early.
pub struct EventGuard<T> {
    event: OwningEvent,
    ctx: CurrentContext,
    stream: Stream,
    payload: Option<T>,
}

impl<T> EventGuard<T> {
    /// Guard `payload` with `event`, which must already be recorded on
    /// `stream`.
    pub fn new(ctx: CurrentContext, event: OwningEvent, stream: Stream, payload: T) -> Self {
        Self {
            event,
            ctx,
            stream,
            payload: Some(payload),
        }
    }

    /// Block until the event completes and return the payload.
    ///
    /// On failure the stream is drained before the payload is released and
    /// the synchronization error is returned.
    pub fn wait(mut self) -> Result<T, FlowError> {
        let payload = match self.payload.take() {
            Some(payload) => payload,
            None => unreachable!("event guard payload taken twice"),
        };
        match self.event.synchronize() {
            Ok(()) => Ok(payload),
            Err(e) => {
                release_after_drain(&self.ctx, self.stream, payload);
                Err(FlowError::sync(format!(
                    "failed to wait on completion marker: {e}"
                )))
            }
        }
    }
}

impl<T> Drop for EventGuard<T> {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            match self.event.synchronize() {
                Ok(()) => drop(payload),
                Err(e) => {
                    warn!(event = %self.event.get(), error = %e, "Marker wait failed, draining stream");
                    release_after_drain(&self.ctx, self.stream, payload);
                }
            }
        }
    }
}

impl<T> fmt::Debug for EventGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventGuard")
            .field("event", &self.event.get())
            .field("stream", &self.stream)
            .field("armed", &self.payload.is_some())
            .finish()
    }
}
