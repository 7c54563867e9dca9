//! Runtime facade wiring the executor, the simulated device and its arena.

use std::sync::Arc;

use flowrt_core::async_value::AsyncValueRef;
use flowrt_core::config::ExecutorConfig;
use flowrt_core::error::Result;
use flowrt_core::executor::HostExecutor;
use flowrt_core::request::{ExecutionContext, RequestContext, RequestContextBuilder};
use flowrt_cpu::{CpuDriver, CpuDriverConfig};
use flowrt_device::allocator::ArenaConfig;
use flowrt_device::conversion::{convert_gpu_tensor_to_host_tensor, convert_host_tensor_to_gpu_tensor};
use flowrt_device::device::GpuDevice;
use flowrt_device::tensor::{DenseGpuTensor, DenseHostTensor};

/// Host executor plus one device.
pub struct Runtime {
    // Released first. Dropping this clone stops the executor only if no
    // request scope or other clone still holds it.
    host: HostExecutor,
    device: GpuDevice,
    driver: Arc<CpuDriver>,
}

impl Runtime {
    /// Create a new runtime builder.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Create a runtime with default settings.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// The host executor.
    pub fn host(&self) -> &HostExecutor {
        &self.host
    }

    /// The device.
    pub fn device(&self) -> &GpuDevice {
        &self.device
    }

    /// The simulated driver backing the device.
    pub fn driver(&self) -> &Arc<CpuDriver> {
        &self.driver
    }

    /// Start building a request scope with request data.
    pub fn request_builder(&self) -> RequestContextBuilder {
        RequestContext::builder(self.host.clone())
    }

    /// Register a new request.
    pub fn new_request(&self) -> Result<RequestContext> {
        self.request_builder().build()
    }

    /// Register a new request and wrap it for conversion functions.
    pub fn execution_context(&self) -> Result<ExecutionContext> {
        Ok(ExecutionContext::new(self.new_request()?))
    }

    /// Copy a host tensor to the device on the default stream.
    pub fn upload(&self, tensor: &DenseHostTensor) -> Result<DenseGpuTensor> {
        convert_host_tensor_to_gpu_tensor(
            self.device.context(),
            self.device.stream(),
            self.device.allocator().as_ref(),
            tensor,
            &self.host,
        )
    }

    /// Copy a device tensor to the host on the default stream.
    pub fn download(&self, tensor: &DenseGpuTensor) -> AsyncValueRef<DenseHostTensor> {
        convert_gpu_tensor_to_host_tensor(
            self.device.context(),
            self.device.stream(),
            tensor,
            &self.host,
        )
    }

    /// Wait for outstanding work, then stop the executor.
    ///
    /// The executor stops even if request scopes still hold it; their later
    /// submissions are rejected.
    pub fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down flowrt runtime");
        self.host.quiesce();
        let synced = self.device.synchronize();
        self.host.shutdown();
        synced
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("host", &self.host)
            .field("device", &self.device)
            .finish()
    }
}

/// Builder for [`Runtime`].
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    executor: ExecutorConfig,
    arena: ArenaConfig,
    driver: CpuDriverConfig,
}

impl RuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the executor configuration.
    #[must_use]
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    /// Set the device arena configuration.
    #[must_use]
    pub fn arena_config(mut self, config: ArenaConfig) -> Self {
        self.arena = config;
        self
    }

    /// Set the simulated driver configuration.
    #[must_use]
    pub fn driver_config(mut self, config: CpuDriverConfig) -> Self {
        self.driver = config;
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Result<Runtime> {
        let driver = Arc::new(CpuDriver::new(self.driver)?);
        let device = GpuDevice::new(driver.clone(), self.arena)?;
        let host = HostExecutor::new(self.executor)?;

        tracing::info!(
            device = %driver.config().device_name,
            arena_capacity = device.memory_stats().capacity,
            workers = host.config().num_workers,
            blocking_workers = host.config().num_blocking_workers,
            "flowrt runtime ready"
        );

        Ok(Runtime {
            host,
            device,
            driver,
        })
    }
}
