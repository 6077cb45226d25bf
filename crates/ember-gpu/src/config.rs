//! Resource pool configuration.

use std::time::Duration;

/// Size of one staging chunk.
pub const DEFAULT_STAGING_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Timeout for every blocking fence wait; exceeding it is treated as device loss.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`GpuResources`](crate::resources::GpuResources).
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// Number of frames that may be in flight at once.
    pub back_buffer_count: u32,
    /// Size of each staging chunk in bytes.
    pub staging_chunk_size: u64,
    /// Descriptor sets allocated per backing descriptor pool.
    pub descriptor_sets_per_pool: u32,
    /// Timeout applied to blocking fence waits.
    pub fence_timeout: Duration,
    /// Initial number of recycle-bin slots.
    pub recycle_bin_capacity: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            back_buffer_count: 3,
            staging_chunk_size: DEFAULT_STAGING_CHUNK_SIZE,
            descriptor_sets_per_pool: 10,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
            recycle_bin_capacity: 16,
        }
    }
}

impl ResourceConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of back buffers.
    pub fn with_back_buffer_count(mut self, count: u32) -> Self {
        self.back_buffer_count = count.max(1);
        self
    }

    /// Set the staging chunk size.
    pub fn with_staging_chunk_size(mut self, size: u64) -> Self {
        self.staging_chunk_size = size.max(1);
        self
    }

    /// Set the number of descriptor sets per backing pool.
    pub fn with_descriptor_sets_per_pool(mut self, count: u32) -> Self {
        self.descriptor_sets_per_pool = count.max(1);
        self
    }

    /// Set the fence timeout.
    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Set the initial recycle-bin capacity.
    pub fn with_recycle_bin_capacity(mut self, capacity: usize) -> Self {
        self.recycle_bin_capacity = capacity;
        self
    }

    /// Fence timeout in nanoseconds, saturating at `u64::MAX`.
    pub fn fence_timeout_ns(&self) -> u64 {
        u64::try_from(self.fence_timeout.as_nanos()).unwrap_or(u64::MAX)
    }
}
