//! Device memory arena.
//!
//! [`SubAllocator`] reserves one region from the driver and hands out
//! aligned sub-ranges of it as [`GpuBuffer`]s. Buffers free themselves when
//! the last reference drops.
//!
//! With [`ReusePolicy::StreamOrdered`] a freed block is not reusable right
//! away. Its allocation stream may still have work touching it, so a marker
//! is recorded on that stream and the block waits on a pending list:
//!
//! - the same stream may take it back immediately, since the stream runs the
//!   old and the new use in order;
//! - other streams get it once the marker has completed.
//!
//! ```text
//!   allocate          drop(GpuBuffer)          marker done
//! free ──────▶ live ─────────────────▶ pending ───────────▶ free
//!                                         │ same stream
//!                                         └──────────────▶ live
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use flowrt_core::error::{FlowError, Result};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

use crate::driver::{CurrentContext, DevicePointer, EventFlags, Platform, Stream};
use crate::stream::OwningEvent;

// ============================================================================
// Allocator Contract
// ============================================================================

/// A source of device buffers.
pub trait GpuAllocator: Send + Sync {
    /// Allocate `size` bytes for use on `stream`.
    fn allocate(&self, size: usize, stream: Stream) -> Result<GpuBuffer>;

    /// Return memory whose last use was ordered on `stream`.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` was not handed out by this allocator or was already
    /// returned.
    fn deallocate(&self, ptr: DevicePointer, stream: Stream);

    /// Platform of the memory this allocator hands out.
    fn platform(&self) -> Platform;
}

/// Owned range of device memory.
///
/// Shared ownership is expressed by wrapping it in an `Arc`; the range is
/// returned to its allocator exactly once, when the buffer drops.
pub struct GpuBuffer {
    ptr: DevicePointer,
    size: usize,
    stream: Stream,
    allocator: Arc<dyn GpuAllocator>,
}

impl GpuBuffer {
    /// Wrap a range handed out by `allocator`.
    pub fn new(
        ptr: DevicePointer,
        size: usize,
        stream: Stream,
        allocator: Arc<dyn GpuAllocator>,
    ) -> Self {
        Self {
            ptr,
            size,
            stream,
            allocator,
        }
    }

    /// Start of the range.
    pub fn pointer(&self) -> DevicePointer {
        self.ptr
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check for a zero-byte buffer.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Stream the buffer was allocated for.
    pub fn stream(&self) -> Stream {
        self.stream
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.allocator.deallocate(self.ptr, self.stream);
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("stream", &self.stream)
            .finish()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// When freed memory may be handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReusePolicy {
    /// Reuse ordered by the stream that last used the block.
    #[default]
    StreamOrdered,
    /// Bump allocation; addresses are never reused.
    Never,
}

/// Configuration for a [`SubAllocator`].
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Bytes reserved from the driver.
    pub capacity: usize,
    /// Allocation granularity (power of two).
    pub alignment: usize,
    /// Reuse policy for freed blocks.
    pub reuse: ReusePolicy,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024,
            alignment: 256,
            reuse: ReusePolicy::StreamOrdered,
        }
    }
}

impl ArenaConfig {
    /// Creates a minimal configuration (1 MiB).
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            capacity: 1024 * 1024,
            ..Self::default()
        }
    }

    /// Creates a bump-only configuration.
    #[must_use]
    pub fn bump(capacity: usize) -> Self {
        Self {
            capacity,
            reuse: ReusePolicy::Never,
            ..Self::default()
        }
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(FlowError::config(format!(
                "arena alignment {} is not a power of two",
                self.alignment
            )));
        }
        if self.capacity < self.alignment {
            return Err(FlowError::config(format!(
                "arena capacity {} is smaller than its alignment {}",
                self.capacity, self.alignment
            )));
        }
        Ok(())
    }
}

/// Builder for [`ArenaConfig`].
#[derive(Debug, Default)]
pub struct ArenaConfigBuilder {
    config: ArenaConfig,
}

impl ArenaConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the capacity in bytes.
    #[must_use]
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.config.capacity = bytes;
        self
    }

    /// Sets the allocation granularity.
    #[must_use]
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.config.alignment = alignment;
        self
    }

    /// Sets the reuse policy.
    #[must_use]
    pub fn with_reuse_policy(mut self, reuse: ReusePolicy) -> Self {
        self.config.reuse = reuse;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ArenaConfig {
        self.config
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Statistics snapshot of a [`SubAllocator`].
#[derive(Debug, Clone, Default)]
pub struct ArenaStats {
    /// Usable bytes in the region.
    pub capacity: usize,
    /// Bytes held by live buffers.
    pub in_use: usize,
    /// Freed bytes waiting on a marker.
    pub pending: usize,
    /// Bytes ready for any stream.
    pub free: usize,
    /// Bytes withdrawn after a failed marker and stream sync.
    pub quarantined: usize,
    /// Largest `in_use` seen.
    pub high_water: usize,
    /// Live buffers.
    pub live_buffers: usize,
    /// Successful allocations.
    pub allocations: u64,
    /// Deallocations.
    pub deallocations: u64,
    /// Allocations placed on memory that had been used before.
    pub reuses: u64,
}

struct LiveBlock {
    offset: usize,
    len: usize,
}

struct PendingBlock {
    offset: usize,
    len: usize,
    stream: Stream,
    marker: Arc<OwningEvent>,
}

#[derive(Default)]
struct ArenaState {
    /// Coalesced free ranges, offset -> length.
    free: BTreeMap<usize, usize>,
    pending: Vec<PendingBlock>,
    /// Keyed by device address.
    live: HashMap<usize, LiveBlock>,
    in_use: usize,
    free_bytes: usize,
    pending_bytes: usize,
    quarantined: usize,
    high_water: usize,
    /// End of the highest range ever handed out.
    touched_end: usize,
    allocations: u64,
    deallocations: u64,
    reuses: u64,
}

impl ArenaState {
    fn insert_free(&mut self, offset: usize, len: usize) {
        self.free_bytes += len;
        let mut start = offset;
        let mut end = offset + len;

        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }
        self.free.insert(start, end - start);
    }

    fn take_first_fit(&mut self, len: usize) -> Option<usize> {
        let (&offset, &block_len) = self.free.iter().find(|(_, &l)| l >= len)?;
        self.free.remove(&offset);
        if block_len > len {
            self.free.insert(offset + len, block_len - len);
        }
        self.free_bytes -= len;
        Some(offset)
    }

    /// Take a pending block freed on `stream`; the stream orders its reuse.
    fn take_same_stream(&mut self, len: usize, stream: Stream) -> Option<usize> {
        let index = self
            .pending
            .iter()
            .position(|block| block.stream == stream && block.len >= len)?;
        let block = self.pending.swap_remove(index);
        self.pending_bytes -= block.len;
        if block.len > len {
            self.pending_bytes += block.len - len;
            self.pending.push(PendingBlock {
                offset: block.offset + len,
                len: block.len - len,
                stream: block.stream,
                marker: block.marker,
            });
        }
        Some(block.offset)
    }

    /// Retire pending blocks guarded by markers another caller waited on.
    ///
    /// Blocks taken or split while the waits ran are matched by marker.
    fn resolve_waited(&mut self, waited: &[(Arc<OwningEvent>, bool)]) {
        let mut index = 0;
        while index < self.pending.len() {
            let outcome = waited
                .iter()
                .find(|(marker, _)| Arc::ptr_eq(marker, &self.pending[index].marker))
                .map(|(_, settled)| *settled);
            match outcome {
                None => index += 1,
                Some(settled) => {
                    let block = self.pending.swap_remove(index);
                    self.pending_bytes -= block.len;
                    if settled {
                        self.insert_free(block.offset, block.len);
                    } else {
                        self.quarantined += block.len;
                    }
                }
            }
        }
    }

    /// Move pending blocks whose marker has completed to the free list.
    fn reclaim_completed(&mut self) -> usize {
        let mut reclaimed = 0;
        let mut index = 0;
        while index < self.pending.len() {
            let done = match self.pending[index].marker.query() {
                Ok(done) => done,
                Err(e) => {
                    debug!(error = %e, "Marker query failed; block stays pending");
                    false
                }
            };
            if done {
                let block = self.pending.swap_remove(index);
                self.pending_bytes -= block.len;
                self.insert_free(block.offset, block.len);
                reclaimed += block.len;
            } else {
                index += 1;
            }
        }
        reclaimed
    }
}

/// Stream-ordered sub-allocator over one device region.
///
/// Address 0 is never handed out, live buffers never overlap, and
/// zero-byte requests get a unique address backed by one alignment granule.
pub struct SubAllocator {
    ctx: CurrentContext,
    config: ArenaConfig,
    base: DevicePointer,
    /// First usable offset within the region.
    start: usize,
    state: Mutex<ArenaState>,
    self_ref: Weak<SubAllocator>,
}

impl SubAllocator {
    /// Reserve `config.capacity` bytes from the driver.
    pub fn new(ctx: CurrentContext, config: ArenaConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let base = ctx.mem_alloc(config.capacity).map_err(|e| {
            FlowError::allocation(config.capacity, format!("cannot reserve arena region: {e}"))
        })?;

        let align = config.alignment;
        let mut start = base.addr().next_multiple_of(align) - base.addr();
        if base.addr() + start == 0 {
            start += align;
        }
        if start >= config.capacity {
            // Best effort, the region is unusable anyway.
            let _ = ctx.mem_free(base);
            return Err(FlowError::config("arena capacity too small for region alignment"));
        }

        let mut state = ArenaState::default();
        state.insert_free(start, config.capacity - start);

        info!(
            platform = %base.platform(),
            base = %base,
            capacity = config.capacity,
            alignment = config.alignment,
            reuse = ?config.reuse,
            "Created device arena"
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            ctx,
            config,
            base,
            start,
            state: Mutex::new(state),
            self_ref: self_ref.clone(),
        }))
    }

    /// The arena's configuration.
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Usable bytes.
    pub fn capacity(&self) -> usize {
        self.config.capacity - self.start
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ArenaStats {
        let state = self.state.lock();
        ArenaStats {
            capacity: self.capacity(),
            in_use: state.in_use,
            pending: state.pending_bytes,
            free: state.free_bytes,
            quarantined: state.quarantined,
            high_water: state.high_water,
            live_buffers: state.live.len(),
            allocations: state.allocations,
            deallocations: state.deallocations,
            reuses: state.reuses,
        }
    }

    fn rounded_len(&self, size: usize) -> Result<usize> {
        size.max(1)
            .checked_next_multiple_of(self.config.alignment)
            .ok_or_else(|| FlowError::allocation(size, "rounded size overflows"))
    }

    /// Find room for `len` bytes, waiting on pending markers as a last
    /// resort.
    fn place(&self, len: usize, stream: Stream) -> Option<usize> {
        let mut state = self.state.lock();
        loop {
            if let Some(offset) = state.take_first_fit(len) {
                return Some(offset);
            }
            if self.config.reuse == ReusePolicy::Never {
                return None;
            }
            if let Some(offset) = state.take_same_stream(len, stream) {
                return Some(offset);
            }
            if state.reclaim_completed() > 0 {
                continue;
            }
            if state.pending.is_empty() {
                return None;
            }

            // Pending blocks stay listed while we wait, so concurrent callers
            // still see the capacity and wait on the same markers.
            let mut markers: Vec<(Arc<OwningEvent>, Stream)> = Vec::new();
            for block in &state.pending {
                if !markers.iter().any(|(marker, _)| Arc::ptr_eq(marker, &block.marker)) {
                    markers.push((Arc::clone(&block.marker), block.stream));
                }
            }

            debug!(markers = markers.len(), "Arena exhausted, waiting on pending markers");
            let waited: Vec<(Arc<OwningEvent>, bool)> = MutexGuard::unlocked(&mut state, || {
                markers
                    .into_iter()
                    .map(|(marker, marker_stream)| {
                        let settled = self.settle(&marker, marker_stream);
                        (marker, settled)
                    })
                    .collect()
            });
            state.resolve_waited(&waited);
        }
    }

    /// Wait until nothing on `stream` before `marker` can still run.
    ///
    /// Returns `false` if that cannot be established.
    fn settle(&self, marker: &OwningEvent, stream: Stream) -> bool {
        match marker.synchronize() {
            Ok(()) => true,
            Err(e) => {
                warn!(stream = %stream, error = %e, "Marker wait failed, synchronizing stream");
                match self.ctx.stream_synchronize(stream) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(
                            stream = %stream,
                            error = %e,
                            "Cannot order block reuse; quarantining"
                        );
                        false
                    }
                }
            }
        }
    }

    fn record_marker(&self, stream: Stream) -> crate::error::DeviceResult<OwningEvent> {
        let marker = self.ctx.create_event(EventFlags::DisableTiming)?;
        marker.record(stream)?;
        Ok(marker)
    }
}

impl GpuAllocator for SubAllocator {
    fn allocate(&self, size: usize, stream: Stream) -> Result<GpuBuffer> {
        let len = self.rounded_len(size)?;
        if len > self.capacity() {
            return Err(FlowError::OutOfMemory {
                requested: size,
                available: self.stats().free,
            });
        }

        let allocator: Arc<dyn GpuAllocator> = match self.self_ref.upgrade() {
            Some(arena) => arena,
            None => return Err(FlowError::allocation(size, "arena is shutting down")),
        };

        let Some(offset) = self.place(len, stream) else {
            let stats = self.stats();
            warn!(size, free = stats.free, pending = stats.pending, "Device arena exhausted");
            return Err(FlowError::OutOfMemory {
                requested: size,
                available: stats.free,
            });
        };

        let ptr = self.base.offset(offset);
        {
            let mut state = self.state.lock();
            state.live.insert(ptr.addr(), LiveBlock { offset, len });
            state.in_use += len;
            state.high_water = state.high_water.max(state.in_use);
            state.allocations += 1;
            if offset < state.touched_end {
                state.reuses += 1;
            }
            state.touched_end = state.touched_end.max(offset + len);
        }

        trace!(ptr = %ptr, size, len, stream = %stream, "Device allocation");
        Ok(GpuBuffer::new(ptr, size, stream, allocator))
    }

    fn deallocate(&self, ptr: DevicePointer, stream: Stream) {
        let mut state = self.state.lock();
        let block = match state.live.remove(&ptr.addr()) {
            Some(block) if ptr.platform() == self.base.platform() => block,
            _ => panic!("deallocating {ptr} which is not a live allocation of this arena"),
        };
        state.in_use -= block.len;
        state.deallocations += 1;
        if self.config.reuse == ReusePolicy::Never {
            trace!(ptr = %ptr, len = block.len, "Device deallocation (retired)");
            return;
        }

        trace!(ptr = %ptr, len = block.len, stream = %stream, "Device deallocation");
        // Recorded under the lock so the block is never invisible to
        // concurrent allocations between `live` and `pending`.
        match self.record_marker(stream) {
            Ok(marker) => {
                state.pending_bytes += block.len;
                state.pending.push(PendingBlock {
                    offset: block.offset,
                    len: block.len,
                    stream,
                    marker: Arc::new(marker),
                });
            }
            Err(e) => {
                drop(state);
                warn!(stream = %stream, error = %e, "Cannot record release marker, synchronizing stream");
                let synced = self.ctx.stream_synchronize(stream);
                let mut state = self.state.lock();
                match synced {
                    Ok(()) => state.insert_free(block.offset, block.len),
                    Err(e) => {
                        error!(
                            ptr = %ptr,
                            len = block.len,
                            error = %e,
                            "Cannot order block reuse; quarantining"
                        );
                        state.quarantined += block.len;
                    }
                }
            }
        }
    }

    fn platform(&self) -> Platform {
        self.base.platform()
    }
}

impl Drop for SubAllocator {
    fn drop(&mut self) {
        let pending = std::mem::take(&mut self.state.get_mut().pending);
        for block in &pending {
            if let Err(e) = block.marker.synchronize() {
                warn!(error = %e, "Marker wait failed while releasing arena");
            }
        }
        drop(pending);

        if let Err(e) = self.ctx.mem_free(self.base) {
            warn!(base = %self.base, error = %e, "Failed to release arena region");
        }
        info!(base = %self.base, "Released device arena");
    }
}

impl fmt::Debug for SubAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubAllocator")
            .field("base", &self.base)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
