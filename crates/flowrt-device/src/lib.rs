//! # flowrt Device
//!
//! Device-facing half of flowrt: the driver contract, a stream-ordered
//! memory arena and the pipelines that move tensors between host and device.
//!
//! ## Core Abstractions
//!
//! - [`DeviceDriver`] - Memory, streams and completion markers of a backend
//! - [`CurrentContext`] - Handle through which driver operations are issued
//! - [`SubAllocator`] - Device memory arena handing out [`GpuBuffer`]s
//! - [`convert_gpu_tensor_to_host_tensor`] / [`convert_host_tensor_to_gpu_tensor`]
//!
//! Backends implement [`DeviceDriver`]; `flowrt-cpu` provides a simulated
//! one.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod conversion;
pub mod device;
pub mod driver;
pub mod error;
pub mod stream;
pub mod tensor;

#[cfg(test)]
mod mock;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::allocator::{
        ArenaConfig, ArenaConfigBuilder, ArenaStats, GpuAllocator, GpuBuffer, ReusePolicy,
        SubAllocator,
    };
    pub use crate::conversion::{
        convert_gpu_tensor_to_host_tensor, convert_host_tensor_to_gpu_tensor,
        register_gpu_tensor_conversion_fns, ConversionFn, ConversionRegistry, ConversionTable,
        TensorKind,
    };
    pub use crate::device::GpuDevice;
    pub use crate::driver::{
        CurrentContext, DeviceDriver, DevicePointer, Event, EventFlags, Platform, Pointer, Stream,
    };
    pub use crate::error::{DeviceError, DeviceResult};
    pub use crate::stream::{EventGuard, OwningEvent, OwningStream};
    pub use crate::tensor::{DType, DenseGpuTensor, DenseHostTensor, TensorMetadata};
}

pub use allocator::{GpuAllocator, GpuBuffer, SubAllocator};
pub use conversion::{convert_gpu_tensor_to_host_tensor, convert_host_tensor_to_gpu_tensor};
pub use device::GpuDevice;
pub use driver::{CurrentContext, DeviceDriver};
pub use error::{DeviceError, DeviceResult};
