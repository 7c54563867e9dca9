//! # flowrt
//!
//! Asynchronous tensor transfers between host and device memory.
//!
//! Every result, error and cancellation flows through one handle, the
//! [`AsyncValueRef`] completion value. Transfers are enqueued on device
//! command streams, followed by a completion marker; a blocking task on the
//! host executor waits on the marker and resolves the result.
//!
//! ## Quick Start
//!
//! ```
//! use flowrt::prelude::*;
//!
//! let runtime = Runtime::builder()
//!     .executor_config(ExecutorConfig::minimal())
//!     .arena_config(ArenaConfig::minimal())
//!     .build()
//!     .unwrap();
//!
//! let data: Vec<u8> = (0..=255).collect();
//! let src = DenseHostTensor::from_slice(TensorMetadata::bytes(256), &data, runtime.host()).unwrap();
//!
//! let on_device = runtime.upload(&src).unwrap();
//! let back = runtime.download(&on_device);
//! assert_eq!(back.wait().as_ref().unwrap().data(), data.as_slice());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────── Host ───────────────────────────┐
//! │ RequestContext ── HostExecutor ── blocking task (waits)   │
//! │                        │                   ▲              │
//! │        pipeline ───────┼── copy + marker ──┼──────────────┤
//! │            │           ▼                   │              │
//! │       SubAllocator   stream FIFO ──────── marker ─ Device │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crates
//!
//! - `flowrt-core` - completion values, executor, request scopes
//! - `flowrt-device` - driver contract, memory arena, pipelines
//! - `flowrt-cpu` - simulated driver

#![warn(missing_docs)]
#![warn(clippy::all)]

mod runtime;

pub use flowrt_core::*;
pub use flowrt_cpu::{CpuDriver, CpuDriverConfig, CpuDriverConfigBuilder, CpuDriverStats, DriverOp};
pub use flowrt_device as device;
pub use runtime::{Runtime, RuntimeBuilder};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{Runtime, RuntimeBuilder};
    pub use flowrt_core::prelude::*;
    pub use flowrt_cpu::{CpuDriver, CpuDriverConfig, CpuDriverConfigBuilder, DriverOp};
    pub use flowrt_device::prelude::*;
}
