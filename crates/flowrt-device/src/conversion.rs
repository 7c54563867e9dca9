//! Tensor transfer pipelines between host and device memory.
//!
//! Both directions follow the same shape:
//!
//! 1. allocate the destination;
//! 2. enqueue the copy on the stream;
//! 3. record a completion marker after it;
//! 4. hand the marker and everything the copy touches to a blocking task
//!    that waits on the marker.
//!
//! Once the copy is enqueued its host memory is visible to the device, so no
//! failure path releases that memory before the stream or marker says the
//! copy is done.
//!
//! Cancellation of the request is not consulted: a transfer that has been
//! started runs to completion.

use std::collections::HashMap;
use std::sync::Arc;

use flowrt_core::async_value::AsyncValueRef;
use flowrt_core::error::{FlowError, Result};
use flowrt_core::executor::HostExecutor;
use flowrt_core::request::ExecutionContext;
use tracing::{debug, trace};

use crate::allocator::GpuAllocator;
use crate::device::GpuDevice;
use crate::driver::{CurrentContext, EventFlags, Pointer, Stream};
use crate::stream::{release_after_drain, EventGuard, OwningEvent};
use crate::tensor::{DenseGpuTensor, DenseHostTensor};

/// Fault channel source tag for host-to-device marker failures.
pub const H2D_FAULT_SOURCE: &str = "host_to_device";

/// Create a marker and record it on `stream`.
fn record_marker(ctx: &CurrentContext, stream: Stream) -> Result<OwningEvent> {
    let marker = ctx
        .create_event(EventFlags::DisableTiming)
        .map_err(|e| FlowError::enqueue(format!("failed to create completion marker: {e}")))?;
    marker
        .record(stream)
        .map_err(|e| FlowError::enqueue(format!("failed to record completion marker: {e}")))?;
    Ok(marker)
}

/// Copy a device tensor into a newly allocated host tensor.
///
/// The returned value resolves once the copy has completed, or with the
/// error of the first stage that failed.
pub fn convert_gpu_tensor_to_host_tensor(
    ctx: &CurrentContext,
    stream: Stream,
    tensor: &DenseGpuTensor,
    host: &HostExecutor,
) -> AsyncValueRef<DenseHostTensor> {
    let size = tensor.size_in_bytes();
    let host_tensor = match DenseHostTensor::create_uninitialized(tensor.metadata().clone(), host)
    {
        Ok(host_tensor) => host_tensor,
        Err(e) => {
            return AsyncValueRef::error(FlowError::allocation(
                size,
                format!("cannot allocate result tensor: {e}"),
            ))
        }
    };

    let dst = Pointer::host(host_tensor.data_ptr());
    let src = Pointer::Device(tensor.buffer().pointer());
    // SAFETY: `host_tensor` is not shared and is only released after the
    // stream or the marker shows the copy finished.
    if let Err(e) = unsafe { ctx.memcpy_async(dst, src, size, stream) } {
        return AsyncValueRef::error(FlowError::enqueue(format!(
            "failed to enqueue device-to-host copy: {e}"
        )));
    }

    // The device buffer travels with the host tensor so neither is released
    // while the copy is in flight.
    let in_flight = (host_tensor, Arc::clone(tensor.buffer()));
    let marker = match record_marker(ctx, stream) {
        Ok(marker) => marker,
        Err(e) => {
            release_after_drain(ctx, stream, in_flight);
            return AsyncValueRef::error(e);
        }
    };

    trace!(size, stream = %stream, "Enqueued device-to-host copy");

    let result = AsyncValueRef::unresolved();
    let producer = result.clone();
    let guard = EventGuard::new(ctx.clone(), marker, stream, in_flight);
    if let Err(e) = host.enqueue_blocking_work(move || match guard.wait() {
        Ok((host_tensor, _source)) => {
            producer.set_value(host_tensor);
        }
        Err(e) => {
            producer.set_error(e);
        }
    }) {
        // The rejected task's guard has already waited on the marker.
        debug!(error = %e, "Device-to-host completion task rejected");
        result.set_error(e);
    }
    result
}

/// Copy a host tensor into newly allocated device memory.
///
/// Returns as soon as the copy is enqueued; work ordered after it on
/// `stream` sees the data. A failure while waiting for the copy is reported
/// on the executor's fault channel under [`H2D_FAULT_SOURCE`].
pub fn convert_host_tensor_to_gpu_tensor(
    ctx: &CurrentContext,
    stream: Stream,
    allocator: &dyn GpuAllocator,
    tensor: &DenseHostTensor,
    host: &HostExecutor,
) -> Result<DenseGpuTensor> {
    let size = tensor.size_in_bytes();
    let buffer = allocator.allocate(size, stream)?;

    let dst = Pointer::Device(buffer.pointer());
    let src = Pointer::host(tensor.data_ptr());
    // SAFETY: a clone of `tensor` is kept alive until the copy is known to
    // have finished.
    unsafe { ctx.memcpy_async(dst, src, size, stream) }
        .map_err(|e| FlowError::enqueue(format!("failed to enqueue host-to-device copy: {e}")))?;

    let marker = match record_marker(ctx, stream) {
        Ok(marker) => marker,
        Err(e) => {
            release_after_drain(ctx, stream, tensor.clone());
            return Err(e);
        }
    };

    trace!(size, stream = %stream, "Enqueued host-to-device copy");

    let faults = host.fault_reporter().clone();
    let guard = EventGuard::new(ctx.clone(), marker, stream, tensor.clone());
    host.enqueue_blocking_work(move || {
        // Only keeps the source alive; nobody is waiting for the outcome.
        if let Err(e) = guard.wait() {
            faults.report(H2D_FAULT_SOURCE, e);
        }
    })?;

    Ok(DenseGpuTensor::new(tensor.metadata().clone(), Arc::new(buffer)))
}

// ============================================================================
// Registration
// ============================================================================

/// Tensor representations known to the conversion table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorKind {
    /// [`DenseHostTensor`].
    DenseHost,
    /// [`DenseGpuTensor`].
    DenseGpu,
}

/// Device-to-host conversion.
pub type DeviceToHostFn =
    fn(&GpuDevice, &DenseGpuTensor, &ExecutionContext) -> AsyncValueRef<DenseHostTensor>;

/// Host-to-device conversion.
pub type HostToDeviceFn =
    fn(&GpuDevice, &DenseHostTensor, &ExecutionContext) -> AsyncValueRef<DenseGpuTensor>;

/// A registered conversion function.
#[derive(Clone, Copy)]
pub enum ConversionFn {
    /// Device to host.
    DeviceToHost(DeviceToHostFn),
    /// Host to device.
    HostToDevice(HostToDeviceFn),
}

impl std::fmt::Debug for ConversionFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceToHost(_) => f.write_str("ConversionFn::DeviceToHost"),
            Self::HostToDevice(_) => f.write_str("ConversionFn::HostToDevice"),
        }
    }
}

/// A dispatch table that accepts conversion functions.
pub trait ConversionRegistry {
    /// Register `conversion` for tensors of kind `from` into kind `to`.
    fn add_tensor_conversion_fn(&mut self, from: TensorKind, to: TensorKind, conversion: ConversionFn);
}

/// Simple map-backed [`ConversionRegistry`].
#[derive(Debug, Default)]
pub struct ConversionTable {
    fns: HashMap<(TensorKind, TensorKind), ConversionFn>,
}

impl ConversionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the conversion from `from` to `to`.
    pub fn get(&self, from: TensorKind, to: TensorKind) -> Option<ConversionFn> {
        self.fns.get(&(from, to)).copied()
    }

    /// Number of registered conversions.
    pub fn len(&self) -> usize {
        self.fns.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

impl ConversionRegistry for ConversionTable {
    fn add_tensor_conversion_fn(&mut self, from: TensorKind, to: TensorKind, conversion: ConversionFn) {
        self.fns.insert((from, to), conversion);
    }
}

fn gpu_to_host(
    device: &GpuDevice,
    tensor: &DenseGpuTensor,
    exec_ctx: &ExecutionContext,
) -> AsyncValueRef<DenseHostTensor> {
    convert_gpu_tensor_to_host_tensor(device.context(), device.stream(), tensor, exec_ctx.host())
}

fn host_to_gpu(
    device: &GpuDevice,
    tensor: &DenseHostTensor,
    exec_ctx: &ExecutionContext,
) -> AsyncValueRef<DenseGpuTensor> {
    match convert_host_tensor_to_gpu_tensor(
        device.context(),
        device.stream(),
        device.allocator().as_ref(),
        tensor,
        exec_ctx.host(),
    ) {
        Ok(gpu_tensor) => AsyncValueRef::available(gpu_tensor),
        Err(e) => AsyncValueRef::error(e),
    }
}

/// Register both transfer directions with `registry`.
pub fn register_gpu_tensor_conversion_fns(registry: &mut dyn ConversionRegistry) {
    registry.add_tensor_conversion_fn(
        TensorKind::DenseGpu,
        TensorKind::DenseHost,
        ConversionFn::DeviceToHost(gpu_to_host),
    );
    registry.add_tensor_conversion_fn(
        TensorKind::DenseHost,
        TensorKind::DenseGpu,
        ConversionFn::HostToDevice(host_to_gpu),
    );
}
