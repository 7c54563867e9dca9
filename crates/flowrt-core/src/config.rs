//! Host executor configuration.

use crate::error::{FlowError, Result};

/// Configuration for the [`HostExecutor`](crate::executor::HostExecutor).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker threads running non-blocking continuations.
    pub num_workers: usize,
    /// Worker threads allowed to block on device waits.
    pub num_blocking_workers: usize,
    /// Capacity of the non-blocking work queue.
    pub queue_capacity: usize,
    /// Capacity of the blocking work queue.
    pub blocking_queue_capacity: usize,
    /// Upper bound on live request scopes (`None` = unbounded).
    pub max_active_requests: Option<usize>,
    /// Largest host tensor allocation in bytes (`None` = unbounded).
    pub max_host_allocation: Option<usize>,
    /// Number of faults retained by the fault channel.
    pub fault_capacity: usize,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            num_workers: cores,
            num_blocking_workers: cores.max(2),
            queue_capacity: 4096,
            blocking_queue_capacity: 1024,
            max_active_requests: None,
            max_host_allocation: None,
            fault_capacity: 256,
            thread_name: "flowrt".to_string(),
        }
    }
}

impl ExecutorConfig {
    /// Creates a minimal configuration (one worker of each kind, small queues).
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            num_workers: 1,
            num_blocking_workers: 1,
            queue_capacity: 64,
            blocking_queue_capacity: 64,
            max_active_requests: None,
            max_host_allocation: None,
            fault_capacity: 32,
            thread_name: "flowrt".to_string(),
        }
    }

    /// Creates a configuration for transfer-heavy workloads.
    ///
    /// Device waits dominate, so the blocking pool is sized well above the
    /// core count.
    #[must_use]
    pub fn for_transfers() -> Self {
        let base = Self::default();
        Self {
            num_blocking_workers: base.num_blocking_workers * 4,
            blocking_queue_capacity: 8192,
            ..base
        }
    }

    /// Check the configuration for values the executor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(FlowError::config("num_workers must be at least 1"));
        }
        if self.num_blocking_workers == 0 {
            return Err(FlowError::config("num_blocking_workers must be at least 1"));
        }
        if self.queue_capacity == 0 || self.blocking_queue_capacity == 0 {
            return Err(FlowError::config("queue capacities must be non-zero"));
        }
        if self.max_active_requests == Some(0) {
            return Err(FlowError::config("max_active_requests must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for [`ExecutorConfig`].
#[derive(Debug, Default)]
pub struct ExecutorConfigBuilder {
    config: ExecutorConfig,
}

impl ExecutorConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a minimal configuration builder.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            config: ExecutorConfig::minimal(),
        }
    }

    /// Sets the number of non-blocking workers.
    #[must_use]
    pub fn with_workers(mut self, count: usize) -> Self {
        self.config.num_workers = count;
        self
    }

    /// Sets the number of blocking workers.
    #[must_use]
    pub fn with_blocking_workers(mut self, count: usize) -> Self {
        self.config.num_blocking_workers = count;
        self
    }

    /// Sets the non-blocking queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Sets the blocking queue capacity.
    #[must_use]
    pub fn with_blocking_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.blocking_queue_capacity = capacity;
        self
    }

    /// Limits the number of live request scopes.
    #[must_use]
    pub fn with_max_active_requests(mut self, limit: usize) -> Self {
        self.config.max_active_requests = Some(limit);
        self
    }

    /// Limits the size of a single host tensor allocation.
    #[must_use]
    pub fn with_max_host_allocation(mut self, bytes: usize) -> Self {
        self.config.max_host_allocation = Some(bytes);
        self
    }

    /// Sets how many faults the fault channel retains.
    #[must_use]
    pub fn with_fault_capacity(mut self, capacity: usize) -> Self {
        self.config.fault_capacity = capacity;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ExecutorConfig {
        self.config
    }
}
