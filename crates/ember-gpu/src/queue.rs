//! Queue submission with an implicit semaphore chain.

use crate::device::{DeviceContext, Submission};
use crate::error::Result;
use crate::sync::wait_for_fence;
use ash::vk;
use std::sync::Arc;

/// A native queue whose chained submissions execute in order.
///
/// Each chained submission waits on the semaphore signaled by the previous
/// one. Two owned semaphores alternate as the signal target, so the chain
/// never needs pooled semaphores that a frame reset could hand out again.
pub struct GpuQueue {
    device: Arc<DeviceContext>,
    handle: vk::Queue,
    family: u32,
    wait_stage: vk::PipelineStageFlags,
    semaphores: [vk::Semaphore; 2],
    next_signal: usize,
    wait: Option<vk::Semaphore>,
    submission_count: u64,
}

impl GpuQueue {
    /// Wrap `handle`. Chained submissions wait at `wait_stage`.
    pub fn new(
        device: Arc<DeviceContext>,
        handle: vk::Queue,
        family: u32,
        wait_stage: vk::PipelineStageFlags,
    ) -> Result<Self> {
        let raw = device.raw();
        let first = raw.create_semaphore()?;
        let second = match raw.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                raw.destroy_semaphore(first);
                return Err(e);
            }
        };

        Ok(Self {
            device,
            handle,
            family,
            wait_stage,
            semaphores: [first, second],
            next_signal: 0,
            wait: None,
            submission_count: 0,
        })
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    /// Submit `command_buffers` after every earlier chained submission, without
    /// blocking. `fence` may be null.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit_chained(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
        fence: vk::Fence,
    ) -> Result<()> {
        let signal = self.semaphores[self.next_signal];
        let wait = self.wait.as_slice();
        let wait_stages = [self.wait_stage];

        self.device.raw().queue_submit(
            self.handle,
            &Submission {
                command_buffers,
                wait_semaphores: wait,
                wait_stages: &wait_stages[..wait.len()],
                signal_semaphores: std::slice::from_ref(&signal),
            },
            fence,
        )?;

        self.wait = Some(signal);
        self.next_signal ^= 1;
        self.submission_count += 1;
        Ok(())
    }

    /// Chained submission that blocks until `fence` signals.
    pub fn submit(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Result<()> {
        self.submit_chained(command_buffers, fence)?;
        wait_for_fence(self.device.raw(), fence, timeout_ns)
    }

    /// Submit outside the chain and block until `fence` signals.
    pub fn submit_isolated(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Result<()> {
        self.device.raw().queue_submit(
            self.handle,
            &Submission {
                command_buffers,
                ..Default::default()
            },
            fence,
        )?;
        self.submission_count += 1;
        wait_for_fence(self.device.raw(), fence, timeout_ns)
    }

    /// Total submissions made through this queue.
    pub fn submission_count(&self) -> u64 {
        self.submission_count
    }
}

impl Drop for GpuQueue {
    fn drop(&mut self) {
        for semaphore in self.semaphores {
            self.device.raw().destroy_semaphore(semaphore);
        }
    }
}
