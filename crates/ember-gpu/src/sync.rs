//! Synchronization primitives and their pools.

use crate::device::{DeviceContext, RawDevice};
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Wait for a fence to be signaled.
///
/// A timeout means the device stopped making progress and is reported as
/// [`GpuError::DeviceLost`].
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn wait_for_fence(device: &dyn RawDevice, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    match device.wait_for_fences(&[fence], timeout_ns) {
        Err(GpuError::Vulkan(vk::Result::TIMEOUT)) => Err(GpuError::DeviceLost(format!(
            "fence wait exceeded {timeout_ns} ns"
        ))),
        other => other,
    }
}

/// A simple pool for reusing fences.
///
/// Fences handed out by [`alloc`](Self::alloc) stay exclusive to the caller
/// until the next [`reset`](Self::reset).
pub struct FencePool {
    device: Arc<DeviceContext>,
    fences: Vec<vk::Fence>,
    count: usize,
}

impl FencePool {
    /// Create an empty pool.
    pub fn new(device: Arc<DeviceContext>) -> Self {
        Self {
            device,
            fences: Vec::new(),
            count: 0,
        }
    }

    /// Get an unsignaled fence, reusing an idle one when possible.
    pub fn alloc(&mut self) -> Result<vk::Fence> {
        if let Some(&fence) = self.fences.get(self.count) {
            self.count += 1;
            return Ok(fence);
        }

        let fence = self.device.raw().create_fence(false)?;
        self.fences.push(fence);
        self.count += 1;
        tracing::trace!(total = self.fences.len(), "fence pool grew");

        Ok(fence)
    }

    /// Reset every fence handed out since the last reset and mark them idle.
    ///
    /// The fences are reset natively; a stale signal would make the next wait
    /// return immediately.
    pub fn reset(&mut self) -> Result<()> {
        if self.count > 0 {
            self.device.raw().reset_fences(&self.fences[..self.count])?;
            self.count = 0;
        }
        Ok(())
    }

    /// Wait for `fence` to be signaled, see [`wait_for_fence`].
    pub fn wait(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        wait_for_fence(self.device.raw(), fence, timeout_ns)
    }

    /// Number of fences currently handed out.
    pub fn size(&self) -> usize {
        self.count
    }

    /// Number of fences ever created.
    pub fn capacity(&self) -> usize {
        self.fences.len()
    }
}

impl Drop for FencePool {
    fn drop(&mut self) {
        for fence in self.fences.drain(..) {
            self.device.raw().destroy_fence(fence);
        }
        self.count = 0;
    }
}

/// A simple pool for reusing semaphores.
pub struct SemaphorePool {
    device: Arc<DeviceContext>,
    semaphores: Vec<vk::Semaphore>,
    count: usize,
}

impl SemaphorePool {
    /// Create an empty pool.
    pub fn new(device: Arc<DeviceContext>) -> Self {
        Self {
            device,
            semaphores: Vec::new(),
            count: 0,
        }
    }

    /// Get a semaphore, reusing an idle one when possible.
    pub fn alloc(&mut self) -> Result<vk::Semaphore> {
        if let Some(&semaphore) = self.semaphores.get(self.count) {
            self.count += 1;
            return Ok(semaphore);
        }

        let semaphore = self.device.raw().create_semaphore()?;
        self.semaphores.push(semaphore);
        self.count += 1;

        Ok(semaphore)
    }

    /// Mark every semaphore idle.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Number of semaphores currently handed out.
    pub fn size(&self) -> usize {
        self.count
    }

    /// Number of semaphores ever created.
    pub fn capacity(&self) -> usize {
        self.semaphores.len()
    }
}

impl Drop for SemaphorePool {
    fn drop(&mut self) {
        for semaphore in self.semaphores.drain(..) {
            self.device.raw().destroy_semaphore(semaphore);
        }
        self.count = 0;
    }
}
