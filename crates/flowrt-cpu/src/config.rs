//! Simulated driver configuration.

use std::time::Duration;

use flowrt_core::error::{FlowError, Result};

/// Configuration for a [`CpuDriver`](crate::CpuDriver).
#[derive(Debug, Clone)]
pub struct CpuDriverConfig {
    /// Reported device name.
    pub device_name: String,
    /// Simulated latency added to every copy.
    pub copy_latency: Option<Duration>,
    /// First device address handed out. Must be page aligned and non-zero.
    pub base_address: usize,
}

impl Default for CpuDriverConfig {
    fn default() -> Self {
        Self {
            device_name: "flowrt-cpu".to_string(),
            copy_latency: None,
            base_address: 0x7f00_0000_0000,
        }
    }
}

impl CpuDriverConfig {
    /// Creates a configuration that behaves like a slow link.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            copy_latency: Some(latency),
            ..Self::default()
        }
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.base_address == 0 || self.base_address % crate::memory::PAGE_SIZE != 0 {
            return Err(FlowError::config(format!(
                "base address {:#x} must be a non-zero multiple of the page size",
                self.base_address
            )));
        }
        Ok(())
    }
}

/// Builder for [`CpuDriverConfig`].
#[derive(Debug, Default)]
pub struct CpuDriverConfigBuilder {
    config: CpuDriverConfig,
}

impl CpuDriverConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the device name.
    #[must_use]
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.config.device_name = name.into();
        self
    }

    /// Sets the per-copy latency.
    #[must_use]
    pub fn with_copy_latency(mut self, latency: Duration) -> Self {
        self.config.copy_latency = Some(latency);
        self
    }

    /// Sets the first device address.
    #[must_use]
    pub fn with_base_address(mut self, addr: usize) -> Self {
        self.config.base_address = addr;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> CpuDriverConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_driver_config() {
        let config = CpuDriverConfigBuilder::new()
            .with_device_name("sim0")
            .with_copy_latency(Duration::from_millis(1))
            .build();
        assert_eq!(config.device_name, "sim0");
        assert_eq!(config.copy_latency, Some(Duration::from_millis(1)));
        assert!(config.validate().is_ok());

        let bad = CpuDriverConfigBuilder::new().with_base_address(0).build();
        assert!(bad.validate().is_err());
        let bad = CpuDriverConfigBuilder::new().with_base_address(0x1001).build();
        assert!(bad.validate().is_err());
    }
}
