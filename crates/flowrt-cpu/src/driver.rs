//! Simulated device driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flowrt_core::error::Result;
use flowrt_device::driver::{DeviceDriver, DevicePointer, Event, EventFlags, Platform, Pointer, Stream};
use flowrt_device::error::{DeviceError, DeviceResult};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::CpuDriverConfig;
use crate::fault::{DriverOp, FaultInjector};
use crate::memory::DeviceMemory;
use crate::stream::{Completion, StreamOp, StreamWorker};

#[derive(Default)]
pub(crate) struct DriverCounters {
    pub(crate) bytes_copied: AtomicU64,
    pub(crate) copies: AtomicU64,
    pub(crate) events_recorded: AtomicU64,
}

/// State shared with stream threads.
pub(crate) struct DriverShared {
    pub(crate) config: CpuDriverConfig,
    pub(crate) memory: DeviceMemory,
    pub(crate) faults: FaultInjector,
    pub(crate) stats: DriverCounters,
}

struct EventSlot {
    flags: EventFlags,
    /// Stream and completion once recorded.
    recorded: Option<(u64, Completion)>,
}

/// Statistics snapshot of a [`CpuDriver`].
#[derive(Debug, Clone, Default)]
pub struct CpuDriverStats {
    /// Bytes moved by executed copies.
    pub bytes_copied: u64,
    /// Executed copies.
    pub copies: u64,
    /// Recorded events.
    pub events_recorded: u64,
    /// Live device allocations.
    pub live_allocations: usize,
    /// Bytes in live device allocations.
    pub allocated_bytes: usize,
    /// Live streams.
    pub streams: usize,
    /// Live events.
    pub events: usize,
}

/// Device driver simulated with host memory and one thread per stream.
pub struct CpuDriver {
    shared: Arc<DriverShared>,
    streams: Mutex<HashMap<u64, StreamWorker>>,
    events: Mutex<HashMap<u64, EventSlot>>,
    next_id: AtomicU64,
}

impl CpuDriver {
    /// Create a simulated driver.
    pub fn new(config: CpuDriverConfig) -> Result<Self> {
        config.validate()?;
        info!(
            device = %config.device_name,
            base = format_args!("{:#x}", config.base_address),
            copy_latency = ?config.copy_latency,
            "Initializing CPU device driver"
        );

        let memory = DeviceMemory::new(config.base_address);
        Ok(Self {
            shared: Arc::new(DriverShared {
                config,
                memory,
                faults: FaultInjector::default(),
                stats: DriverCounters::default(),
            }),
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Create a simulated driver with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(CpuDriverConfig::default())
    }

    /// The driver's configuration.
    pub fn config(&self) -> &CpuDriverConfig {
        &self.shared.config
    }

    /// Make the next `count` calls of `op` fail.
    pub fn inject_fault(&self, op: DriverOp, count: usize) {
        self.shared.faults.inject(op, count);
    }

    /// Injected failures of `op` still pending.
    pub fn fault_count(&self, op: DriverOp) -> usize {
        self.shared.faults.remaining(op)
    }

    /// Drop all pending injected failures.
    pub fn clear_faults(&self) {
        self.shared.faults.clear();
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> CpuDriverStats {
        let counters = &self.shared.stats;
        CpuDriverStats {
            bytes_copied: counters.bytes_copied.load(Ordering::Relaxed),
            copies: counters.copies.load(Ordering::Relaxed),
            events_recorded: counters.events_recorded.load(Ordering::Relaxed),
            live_allocations: self.shared.memory.live_allocations(),
            allocated_bytes: self.shared.memory.allocated_bytes(),
            streams: self.streams.lock().len(),
            events: self.events.lock().len(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn validate_pointer(&self, ptr: Pointer, size: usize) -> DeviceResult<()> {
        match ptr {
            Pointer::Device(ptr) => self.shared.memory.validate(ptr, size),
            Pointer::Host(addr) if addr == 0 && size > 0 => {
                Err(DeviceError::InvalidPointer { addr, len: size })
            }
            Pointer::Host(_) => Ok(()),
        }
    }

    fn wait(stream: u64, completion: &Completion) -> DeviceResult<()> {
        match completion.wait() {
            Ok(()) => Ok(()),
            Err(e) => Err(DeviceError::StreamFailed {
                stream,
                reason: e.to_string(),
            }),
        }
    }
}

impl DeviceDriver for CpuDriver {
    fn platform(&self) -> Platform {
        Platform::Simulated
    }

    fn name(&self) -> &str {
        &self.shared.config.device_name
    }

    fn mem_alloc(&self, size: usize) -> DeviceResult<DevicePointer> {
        self.shared.faults.check(DriverOp::MemAlloc)?;
        let ptr = self.shared.memory.alloc(size)?;
        debug!(ptr = %ptr, size, "mem_alloc");
        Ok(ptr)
    }

    fn mem_free(&self, ptr: DevicePointer) -> DeviceResult<()> {
        self.shared.faults.check(DriverOp::MemFree)?;
        self.shared.memory.free(ptr)?;
        debug!(ptr = %ptr, "mem_free");
        Ok(())
    }

    fn stream_create(&self) -> DeviceResult<Stream> {
        self.shared.faults.check(DriverOp::StreamCreate)?;
        let id = self.next_id();
        let worker = StreamWorker::spawn(id, Arc::clone(&self.shared))?;
        self.streams.lock().insert(id, worker);
        debug!(stream = id, "stream_create");
        Ok(Stream::from_raw(id))
    }

    fn stream_destroy(&self, stream: Stream) -> DeviceResult<()> {
        self.shared.faults.check(DriverOp::StreamDestroy)?;
        let worker = self
            .streams
            .lock()
            .remove(&stream.as_raw())
            .ok_or(DeviceError::InvalidStream(stream.as_raw()))?;
        // Joins outside the map lock once queued work has drained.
        drop(worker);
        debug!(stream = %stream, "stream_destroy");
        Ok(())
    }

    fn stream_synchronize(&self, stream: Stream) -> DeviceResult<()> {
        self.shared.faults.check(DriverOp::StreamSynchronize)?;
        let barrier = {
            let streams = self.streams.lock();
            let worker = streams
                .get(&stream.as_raw())
                .ok_or(DeviceError::InvalidStream(stream.as_raw()))?;
            worker.record()?
        };
        Self::wait(stream.as_raw(), &barrier)
    }

    unsafe fn memcpy_async(
        &self,
        dst: Pointer,
        src: Pointer,
        size: usize,
        stream: Stream,
    ) -> DeviceResult<()> {
        self.shared.faults.check(DriverOp::MemcpyAsync)?;
        self.validate_pointer(dst, size)?;
        self.validate_pointer(src, size)?;

        let streams = self.streams.lock();
        let worker = streams
            .get(&stream.as_raw())
            .ok_or(DeviceError::InvalidStream(stream.as_raw()))?;
        worker.submit(StreamOp::Copy { dst, src, size })
    }

    fn event_create(&self, flags: EventFlags) -> DeviceResult<Event> {
        self.shared.faults.check(DriverOp::EventCreate)?;
        let id = self.next_id();
        self.events.lock().insert(
            id,
            EventSlot {
                flags,
                recorded: None,
            },
        );
        Ok(Event::from_raw(id))
    }

    fn event_destroy(&self, event: Event) -> DeviceResult<()> {
        self.shared.faults.check(DriverOp::EventDestroy)?;
        self.events
            .lock()
            .remove(&event.as_raw())
            .map(|_| ())
            .ok_or(DeviceError::InvalidEvent(event.as_raw()))
    }

    fn event_record(&self, event: Event, stream: Stream) -> DeviceResult<()> {
        self.shared.faults.check(DriverOp::EventRecord)?;
        let mut events = self.events.lock();
        let slot = events
            .get_mut(&event.as_raw())
            .ok_or(DeviceError::InvalidEvent(event.as_raw()))?;
        if slot.recorded.is_some() {
            return Err(DeviceError::EventAlreadyRecorded(event.as_raw()));
        }

        let completion = {
            let streams = self.streams.lock();
            let worker = streams
                .get(&stream.as_raw())
                .ok_or(DeviceError::InvalidStream(stream.as_raw()))?;
            worker.record()?
        };
        slot.recorded = Some((stream.as_raw(), completion));
        self.shared
            .stats
            .events_recorded
            .fetch_add(1, Ordering::Relaxed);
        debug!(event = %event, stream = %stream, flags = ?slot.flags, "event_record");
        Ok(())
    }

    fn event_query(&self, event: Event) -> DeviceResult<bool> {
        self.shared.faults.check(DriverOp::EventQuery)?;
        let events = self.events.lock();
        let slot = events
            .get(&event.as_raw())
            .ok_or(DeviceError::InvalidEvent(event.as_raw()))?;
        match &slot.recorded {
            None => Ok(true),
            Some((stream, completion)) => match completion.get() {
                None => Ok(false),
                Some(Ok(())) => Ok(true),
                Some(Err(e)) => Err(DeviceError::StreamFailed {
                    stream: *stream,
                    reason: e.to_string(),
                }),
            },
        }
    }

    fn event_synchronize(&self, event: Event) -> DeviceResult<()> {
        self.shared.faults.check(DriverOp::EventSynchronize)?;
        let recorded = {
            let events = self.events.lock();
            let slot = events
                .get(&event.as_raw())
                .ok_or(DeviceError::InvalidEvent(event.as_raw()))?;
            slot.recorded.clone()
        };
        match recorded {
            None => Ok(()),
            Some((stream, completion)) => Self::wait(stream, &completion),
        }
    }
}

impl Drop for CpuDriver {
    fn drop(&mut self) {
        let streams: Vec<StreamWorker> = self.streams.get_mut().drain().map(|(_, w)| w).collect();
        let count = streams.len();
        drop(streams);
        info!(
            device = %self.shared.config.device_name,
            streams = count,
            "CPU device driver shut down"
        );
    }
}

impl std::fmt::Debug for CpuDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuDriver")
            .field("device", &self.shared.config.device_name)
            .field("stats", &self.stats())
            .finish()
    }
}
