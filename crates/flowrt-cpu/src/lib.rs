//! # flowrt CPU Backend
//!
//! A [`DeviceDriver`](flowrt_device::DeviceDriver) simulated on the host.
//! Device memory is host memory mapped into a sparse address space, each
//! stream is a worker thread running its operations in order, and markers
//! complete when the stream reaches them.
//!
//! Used for testing and as a fallback when no GPU is available. Faults can
//! be injected per operation with [`CpuDriver::inject_fault`].
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use flowrt_cpu::{CpuDriver, DriverOp};
//! use flowrt_device::prelude::*;
//!
//! let driver = Arc::new(CpuDriver::with_defaults().unwrap());
//! let device = GpuDevice::new(driver.clone(), ArenaConfig::minimal()).unwrap();
//! driver.inject_fault(DriverOp::EventCreate, 1);
//! assert_eq!(driver.fault_count(DriverOp::EventCreate), 1);
//! # drop(device);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

mod config;
mod driver;
mod fault;
mod memory;
mod stream;

pub use config::{CpuDriverConfig, CpuDriverConfigBuilder};
pub use driver::{CpuDriver, CpuDriverStats};
pub use fault::DriverOp;
pub use memory::PAGE_SIZE;
