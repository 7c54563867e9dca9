//! Device driver contract.
//!
//! Everything the transfer pipeline needs from a device is expressed by the
//! [`DeviceDriver`] trait: memory, command streams and completion markers
//! (events). Operations are issued through a [`CurrentContext`], the cheap
//! handle standing in for "the device context current on this thread".

use std::fmt;
use std::sync::Arc;

use crate::error::DeviceResult;
use crate::stream::{OwningEvent, OwningStream};

/// Device platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Host-simulated device.
    Simulated,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulated"),
        }
    }
}

/// Address in device memory, tagged with its platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePointer {
    addr: usize,
    platform: Platform,
}

impl DevicePointer {
    /// Create a device pointer.
    pub const fn new(addr: usize, platform: Platform) -> Self {
        Self { addr, platform }
    }

    /// Raw address.
    pub const fn addr(self) -> usize {
        self.addr
    }

    /// Platform the address belongs to.
    pub const fn platform(self) -> Platform {
        self.platform
    }

    /// Pointer `bytes` past this one.
    #[must_use]
    pub const fn offset(self, bytes: usize) -> Self {
        Self {
            addr: self.addr + bytes,
            platform: self.platform,
        }
    }

    /// Check for the null address.
    pub const fn is_null(self) -> bool {
        self.addr == 0
    }
}

impl fmt::Display for DevicePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.platform, self.addr)
    }
}

/// Either side of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pointer {
    /// Host address.
    Host(usize),
    /// Device address.
    Device(DevicePointer),
}

impl Pointer {
    /// Host pointer from a raw address.
    pub fn host(ptr: *const u8) -> Self {
        Self::Host(ptr as usize)
    }
}

/// Handle to a device command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream(u64);

impl Stream {
    /// Wrap a driver-assigned id.
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Driver-assigned id.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Handle to a completion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event(u64);

impl Event {
    /// Wrap a driver-assigned id.
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Driver-assigned id.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event-{}", self.0)
    }
}

/// Flags for event creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFlags {
    /// Default event (includes timing).
    #[default]
    Default,
    /// Event without timing support (less overhead).
    DisableTiming,
    /// Waiting threads block instead of spinning.
    BlockingSync,
}

/// Operations a device backend provides.
///
/// Streams execute their operations in submission order. An event recorded
/// on a stream completes once everything submitted to that stream before the
/// record has completed. Synchronizing an event that was never recorded
/// returns immediately.
pub trait DeviceDriver: Send + Sync {
    /// Platform of the addresses this driver hands out.
    fn platform(&self) -> Platform;

    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Allocate `size` bytes of device memory.
    fn mem_alloc(&self, size: usize) -> DeviceResult<DevicePointer>;

    /// Free memory returned by [`mem_alloc`](Self::mem_alloc).
    fn mem_free(&self, ptr: DevicePointer) -> DeviceResult<()>;

    /// Create a command stream.
    fn stream_create(&self) -> DeviceResult<Stream>;

    /// Destroy a stream once its queued work has finished.
    fn stream_destroy(&self, stream: Stream) -> DeviceResult<()>;

    /// Block until all work queued on `stream` has finished.
    fn stream_synchronize(&self, stream: Stream) -> DeviceResult<()>;

    /// Enqueue a copy of `size` bytes from `src` to `dst` on `stream`.
    ///
    /// # Safety
    ///
    /// Host pointers must be valid for `size` bytes until the copy has
    /// executed, and a host destination must not be read or written by
    /// anyone else until then.
    unsafe fn memcpy_async(
        &self,
        dst: Pointer,
        src: Pointer,
        size: usize,
        stream: Stream,
    ) -> DeviceResult<()>;

    /// Create a detached event.
    fn event_create(&self, flags: EventFlags) -> DeviceResult<Event>;

    /// Destroy an event.
    fn event_destroy(&self, event: Event) -> DeviceResult<()>;

    /// Record `event` after all work currently queued on `stream`.
    fn event_record(&self, event: Event, stream: Stream) -> DeviceResult<()>;

    /// Check whether the work captured by `event` has completed.
    fn event_query(&self, event: Event) -> DeviceResult<bool>;

    /// Block until the work captured by `event` has completed.
    fn event_synchronize(&self, event: Event) -> DeviceResult<()>;
}

/// Handle to the current device context.
#[derive(Clone)]
pub struct CurrentContext {
    driver: Arc<dyn DeviceDriver>,
}

impl CurrentContext {
    /// Make `driver` the current context.
    pub fn new(driver: Arc<dyn DeviceDriver>) -> Self {
        Self { driver }
    }

    /// The underlying driver.
    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    /// Platform of the context.
    pub fn platform(&self) -> Platform {
        self.driver.platform()
    }

    /// Allocate device memory.
    pub fn mem_alloc(&self, size: usize) -> DeviceResult<DevicePointer> {
        self.driver.mem_alloc(size)
    }

    /// Free device memory.
    pub fn mem_free(&self, ptr: DevicePointer) -> DeviceResult<()> {
        self.driver.mem_free(ptr)
    }

    /// Create a stream destroyed on drop.
    pub fn create_stream(&self) -> DeviceResult<OwningStream> {
        let stream = self.driver.stream_create()?;
        Ok(OwningStream::new(self.clone(), stream))
    }

    /// Block until all work on `stream` has finished.
    pub fn stream_synchronize(&self, stream: Stream) -> DeviceResult<()> {
        self.driver.stream_synchronize(stream)
    }

    /// Enqueue an asynchronous copy.
    ///
    /// # Safety
    ///
    /// See [`DeviceDriver::memcpy_async`].
    pub unsafe fn memcpy_async(
        &self,
        dst: Pointer,
        src: Pointer,
        size: usize,
        stream: Stream,
    ) -> DeviceResult<()> {
        // SAFETY: forwarded to the caller.
        unsafe { self.driver.memcpy_async(dst, src, size, stream) }
    }

    /// Create an event destroyed on drop.
    pub fn create_event(&self, flags: EventFlags) -> DeviceResult<OwningEvent> {
        let event = self.driver.event_create(flags)?;
        Ok(OwningEvent::new(self.clone(), event))
    }
}

impl fmt::Debug for CurrentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CurrentContext")
            .field("device", &self.driver.name())
            .field("platform", &self.driver.platform())
            .finish()
    }
}
