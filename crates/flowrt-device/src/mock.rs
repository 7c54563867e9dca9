//! Synchronous in-process driver used by unit tests.
//!
//! Copies execute at enqueue time and events complete when recorded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::driver::{DeviceDriver, DevicePointer, Event, EventFlags, Platform, Pointer, Stream};
use crate::error::{DeviceError, DeviceResult};

const BASE_ADDR: usize = 0x10_0000;

#[derive(Default)]
struct MockState {
    memory: BTreeMap<usize, Vec<u8>>,
    next_addr: usize,
    streams: HashSet<u64>,
    events: HashMap<u64, bool>,
    next_id: u64,
    failures: HashMap<&'static str, usize>,
}

pub(crate) struct MockDriver {
    state: Mutex<MockState>,
    event_syncs: AtomicUsize,
    stream_syncs: AtomicUsize,
}

impl MockDriver {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_addr: BASE_ADDR,
                next_id: 1,
                ..Default::default()
            }),
            event_syncs: AtomicUsize::new(0),
            stream_syncs: AtomicUsize::new(0),
        }
    }

    /// Make the next call of `op` fail.
    pub(crate) fn fail_next(&self, op: &'static str) {
        *self.state.lock().failures.entry(op).or_default() += 1;
    }

    pub(crate) fn live_events(&self) -> usize {
        self.state.lock().events.len()
    }

    pub(crate) fn live_streams(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub(crate) fn event_syncs(&self) -> usize {
        self.event_syncs.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_syncs(&self) -> usize {
        self.stream_syncs.load(Ordering::SeqCst)
    }

    fn check(state: &mut MockState, op: &'static str) -> DeviceResult<()> {
        match state.failures.get_mut(op) {
            Some(count) if *count > 0 => {
                *count -= 1;
                Err(DeviceError::Injected(op))
            }
            _ => Ok(()),
        }
    }

    fn device_range(state: &mut MockState, addr: usize, len: usize) -> DeviceResult<&mut [u8]> {
        let invalid = DeviceError::InvalidPointer { addr, len };
        let (&base, block) = state.memory.range_mut(..=addr).next_back().ok_or(invalid.clone())?;
        let offset = addr - base;
        if offset + len > block.len() {
            return Err(invalid);
        }
        Ok(&mut block[offset..offset + len])
    }
}

impl DeviceDriver for MockDriver {
    fn platform(&self) -> Platform {
        Platform::Simulated
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn mem_alloc(&self, size: usize) -> DeviceResult<DevicePointer> {
        let mut state = self.state.lock();
        Self::check(&mut state, "mem_alloc")?;
        let addr = state.next_addr;
        state.next_addr += size.max(1).next_multiple_of(4096);
        state.memory.insert(addr, vec![0; size]);
        Ok(DevicePointer::new(addr, Platform::Simulated))
    }

    fn mem_free(&self, ptr: DevicePointer) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state
            .memory
            .remove(&ptr.addr())
            .map(|_| ())
            .ok_or(DeviceError::InvalidPointer { addr: ptr.addr(), len: 0 })
    }

    fn stream_create(&self) -> DeviceResult<Stream> {
        let mut state = self.state.lock();
        Self::check(&mut state, "stream_create")?;
        let id = state.next_id;
        state.next_id += 1;
        state.streams.insert(id);
        Ok(Stream::from_raw(id))
    }

    fn stream_destroy(&self, stream: Stream) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if state.streams.remove(&stream.as_raw()) {
            Ok(())
        } else {
            Err(DeviceError::InvalidStream(stream.as_raw()))
        }
    }

    fn stream_synchronize(&self, stream: Stream) -> DeviceResult<()> {
        let mut state = self.state.lock();
        Self::check(&mut state, "stream_synchronize")?;
        self.stream_syncs.fetch_add(1, Ordering::SeqCst);
        if state.streams.contains(&stream.as_raw()) {
            Ok(())
        } else {
            Err(DeviceError::InvalidStream(stream.as_raw()))
        }
    }

    unsafe fn memcpy_async(
        &self,
        dst: Pointer,
        src: Pointer,
        size: usize,
        stream: Stream,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        Self::check(&mut state, "memcpy_async")?;
        if !state.streams.contains(&stream.as_raw()) {
            return Err(DeviceError::InvalidStream(stream.as_raw()));
        }
        if size == 0 {
            return Ok(());
        }
        let bytes = match src {
            Pointer::Device(ptr) => Self::device_range(&mut state, ptr.addr(), size)?.to_vec(),
            // SAFETY: the caller guarantees the host range is valid.
            Pointer::Host(addr) => unsafe {
                std::slice::from_raw_parts(addr as *const u8, size).to_vec()
            },
        };
        match dst {
            Pointer::Device(ptr) => {
                Self::device_range(&mut state, ptr.addr(), size)?.copy_from_slice(&bytes)
            }
            // SAFETY: the caller guarantees exclusive access to the host range.
            Pointer::Host(addr) => unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, size)
            },
        }
        Ok(())
    }

    fn event_create(&self, _flags: EventFlags) -> DeviceResult<Event> {
        let mut state = self.state.lock();
        Self::check(&mut state, "event_create")?;
        let id = state.next_id;
        state.next_id += 1;
        state.events.insert(id, false);
        Ok(Event::from_raw(id))
    }

    fn event_destroy(&self, event: Event) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state
            .events
            .remove(&event.as_raw())
            .map(|_| ())
            .ok_or(DeviceError::InvalidEvent(event.as_raw()))
    }

    fn event_record(&self, event: Event, stream: Stream) -> DeviceResult<()> {
        let mut state = self.state.lock();
        Self::check(&mut state, "event_record")?;
        if !state.streams.contains(&stream.as_raw()) {
            return Err(DeviceError::InvalidStream(stream.as_raw()));
        }
        match state.events.get_mut(&event.as_raw()) {
            Some(recorded) if *recorded => Err(DeviceError::EventAlreadyRecorded(event.as_raw())),
            Some(recorded) => {
                *recorded = true;
                Ok(())
            }
            None => Err(DeviceError::InvalidEvent(event.as_raw())),
        }
    }

    fn event_query(&self, event: Event) -> DeviceResult<bool> {
        let mut state = self.state.lock();
        Self::check(&mut state, "event_query")?;
        if state.events.contains_key(&event.as_raw()) {
            Ok(true)
        } else {
            Err(DeviceError::InvalidEvent(event.as_raw()))
        }
    }

    fn event_synchronize(&self, event: Event) -> DeviceResult<()> {
        let mut state = self.state.lock();
        Self::check(&mut state, "event_synchronize")?;
        self.event_syncs.fetch_add(1, Ordering::SeqCst);
        if state.events.contains_key(&event.as_raw()) {
            Ok(())
        } else {
            Err(DeviceError::InvalidEvent(event.as_raw()))
        }
    }
}
