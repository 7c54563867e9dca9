//! GPU device handle used by registered conversion functions.

use std::fmt;
use std::sync::Arc;

use flowrt_core::error::{FlowError, Result};
use tracing::info;

use crate::allocator::{ArenaConfig, ArenaStats, GpuAllocator, SubAllocator};
use crate::driver::{CurrentContext, DeviceDriver, Platform, Stream};
use crate::stream::OwningStream;

/// A device context with its default stream and memory arena.
pub struct GpuDevice {
    // Dropped before the stream so pending release markers are waited on
    // while the stream still exists.
    allocator: Arc<SubAllocator>,
    stream: OwningStream,
    ctx: CurrentContext,
}

impl GpuDevice {
    /// Open a device on `driver`.
    pub fn new(driver: Arc<dyn DeviceDriver>, arena: ArenaConfig) -> Result<Self> {
        let ctx = CurrentContext::new(driver);
        let stream = ctx
            .create_stream()
            .map_err(|e| FlowError::device(format!("cannot create default stream: {e}")))?;
        let allocator = SubAllocator::new(ctx.clone(), arena)?;

        info!(
            device = ctx.driver().name(),
            platform = %ctx.platform(),
            stream = %stream.get(),
            "Opened GPU device"
        );

        Ok(Self {
            allocator,
            stream,
            ctx,
        })
    }

    /// The device context.
    pub fn context(&self) -> &CurrentContext {
        &self.ctx
    }

    /// The default stream.
    pub fn stream(&self) -> Stream {
        self.stream.get()
    }

    /// The device arena.
    pub fn allocator(&self) -> &Arc<SubAllocator> {
        &self.allocator
    }

    /// Platform of the device.
    pub fn platform(&self) -> Platform {
        self.allocator.platform()
    }

    /// Arena statistics.
    pub fn memory_stats(&self) -> ArenaStats {
        self.allocator.stats()
    }

    /// Block until the default stream is idle.
    pub fn synchronize(&self) -> Result<()> {
        self.stream
            .synchronize()
            .map_err(|e| FlowError::sync(format!("default stream: {e}")))
    }
}

impl fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDevice")
            .field("context", &self.ctx)
            .field("stream", &self.stream.get())
            .finish()
    }
}
