//! # flowrt Core
//!
//! Host-side primitives for the flowrt transfer engine.
//!
//! ## Core Abstractions
//!
//! - [`AsyncValueRef`] - One-shot, reference-counted completion value
//! - [`HostExecutor`] - Worker pools with bounded work and blocking-work queues
//! - [`RequestContext`] - Per-request cancellation slot and request data
//! - [`FaultReporter`] - Retained channel for faults with no caller to report to
//!
//! ## Example
//!
//! ```
//! use flowrt_core::prelude::*;
//!
//! let host = HostExecutor::new(ExecutorConfig::minimal()).unwrap();
//! let answer = host.run_blocking_work(|| Ok(6 * 7));
//! assert_eq!(answer.wait().as_ref().ok(), Some(&42));
//!
//! let request = RequestContext::create(&host);
//! request.cancel();
//! assert!(request.is_cancelled());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod async_value;
pub mod config;
pub mod error;
pub mod executor;
pub mod fault;
pub mod request;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::async_value::{AsyncState, AsyncValueRef};
    pub use crate::config::{ExecutorConfig, ExecutorConfigBuilder};
    pub use crate::error::{ErrorKind, FlowError, Result};
    pub use crate::executor::{ExecutorStats, HostExecutor, RequestId};
    pub use crate::fault::{Fault, FaultReporter};
    pub use crate::request::{ExecutionContext, RequestContext, RequestContextBuilder};
}

pub use async_value::AsyncValueRef;
pub use error::{FlowError, Result};
pub use executor::HostExecutor;
pub use fault::FaultReporter;
pub use request::{ExecutionContext, RequestContext};
