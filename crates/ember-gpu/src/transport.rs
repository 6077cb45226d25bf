//! Host to device upload batching.
//!
//! Upload commands recorded during a frame share one lazily opened command
//! buffer, submitted by [`TransportHub::depart`] ahead of the frame's work.

use crate::command::{
    begin_command_buffer, end_command_buffer, CommandBuffer, CommandBufferDesc, CommandBufferPool,
};
use crate::device::{DeviceContext, MappedPtr};
use crate::error::Result;
use crate::queue::GpuQueue;
use crate::registry::ContextId;
use crate::staging::StagingBufferPool;
use crate::sync::FencePool;
use ash::vk;
use bytemuck::Pod;
use parking_lot::Mutex;
use std::sync::Arc;

/// Pools the transport hub borrows while recording.
///
/// Locks are taken in the order command pool, fence pool, queue.
pub struct TransportLinks<'a> {
    /// Context doing the recording.
    pub context: ContextId,
    /// Command buffer pool of `context`.
    pub commands: &'a Arc<Mutex<CommandBufferPool>>,
    pub fences: &'a Mutex<FencePool>,
    pub queue: &'a Mutex<GpuQueue>,
}

struct Batch {
    cmd: CommandBuffer,
    context: ContextId,
    commands: Arc<Mutex<CommandBufferPool>>,
}

#[cfg(feature = "async-buffer-update")]
struct StagedCopy {
    dst: MappedPtr,
    region: crate::staging::StagingRegion,
}

/// Batches upload commands from every recording context into one primary
/// command buffer per frame.
pub struct TransportHub {
    device: Arc<DeviceContext>,
    queue_family: u32,
    fence_timeout_ns: u64,
    batch: Option<Batch>,
    #[cfg(feature = "async-buffer-update")]
    transfers: Vec<StagedCopy>,
}

impl TransportHub {
    /// Create a hub recording for `queue_family`.
    pub fn new(device: Arc<DeviceContext>, queue_family: u32, fence_timeout_ns: u64) -> Self {
        Self {
            device,
            queue_family,
            fence_timeout_ns,
            batch: None,
            #[cfg(feature = "async-buffer-update")]
            transfers: Vec::new(),
        }
    }

    /// Copy `src` into mapped device memory at `dst`.
    ///
    /// With the `async-buffer-update` feature the data is staged and copied at
    /// the next [`depart`](Self::depart) instead.
    ///
    /// # Safety
    /// `dst` must be valid for `src.len()` bytes of writes until the copy
    /// happens, and not be read by the device concurrently.
    pub unsafe fn check_in_copy(
        &mut self,
        dst: MappedPtr,
        src: &[u8],
        staging: &mut StagingBufferPool,
    ) -> Result<()> {
        unsafe { self.copy(dst, src, staging) }
    }

    /// [`check_in_copy`](Self::check_in_copy) for any plain-old-data slice.
    ///
    /// # Safety
    /// See [`check_in_copy`](Self::check_in_copy).
    pub unsafe fn check_in_pod<T: Pod>(
        &mut self,
        dst: MappedPtr,
        src: &[T],
        staging: &mut StagingBufferPool,
    ) -> Result<()> {
        unsafe { self.copy(dst, bytemuck::cast_slice(src), staging) }
    }

    #[cfg(not(feature = "async-buffer-update"))]
    unsafe fn copy(
        &mut self,
        dst: MappedPtr,
        src: &[u8],
        _staging: &mut StagingBufferPool,
    ) -> Result<()> {
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.len()) };
        Ok(())
    }

    #[cfg(feature = "async-buffer-update")]
    unsafe fn copy(
        &mut self,
        dst: MappedPtr,
        src: &[u8],
        staging: &mut StagingBufferPool,
    ) -> Result<()> {
        let region = staging.alloc(src.len() as u64, 1)?;
        region.write(src)?;
        self.transfers.push(StagedCopy { dst, region });
        Ok(())
    }

    /// Record upload commands into the current batch.
    ///
    /// With `immediate` the batch is submitted right away and this call blocks
    /// until the device has executed it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn check_in(
        &mut self,
        links: &TransportLinks<'_>,
        record: impl FnOnce(vk::CommandBuffer),
        immediate: bool,
    ) -> Result<()> {
        let cmd = self.open(links)?;
        record(cmd);

        if immediate {
            self.flush_immediate(links)?;
        }
        Ok(())
    }

    fn open(&mut self, links: &TransportLinks<'_>) -> Result<vk::CommandBuffer> {
        if let Some(batch) = &self.batch {
            return Ok(batch.cmd.handle);
        }

        let mut commands = links.commands.lock();
        let cmd = commands.request(CommandBufferDesc::primary(self.queue_family))?;
        if let Err(e) = begin_command_buffer(
            self.device.raw(),
            cmd.handle,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ) {
            commands.yield_buffer(cmd);
            return Err(e);
        }

        self.batch = Some(Batch {
            cmd,
            context: links.context,
            commands: links.commands.clone(),
        });
        Ok(cmd.handle)
    }

    fn flush_immediate(&mut self, links: &TransportLinks<'_>) -> Result<()> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };

        let result = self.submit_and_wait(batch.cmd.handle, links);
        batch.commands.lock().yield_buffer(batch.cmd);
        result
    }

    fn submit_and_wait(&self, cmd: vk::CommandBuffer, links: &TransportLinks<'_>) -> Result<()> {
        end_command_buffer(self.device.raw(), cmd)?;
        let fence = links.fences.lock().alloc()?;
        links
            .queue
            .lock()
            .submit_isolated(&[cmd], fence, self.fence_timeout_ns)
    }

    /// Submit the open batch through the queue's chain and apply staged copies.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn depart(&mut self, queue: &Mutex<GpuQueue>) -> Result<()> {
        if let Some(batch) = self.batch.take() {
            tracing::trace!(context = batch.context.0, "transport batch departs");
            let result = end_command_buffer(self.device.raw(), batch.cmd.handle)
                .and_then(|()| {
                    queue
                        .lock()
                        .submit_chained(&[batch.cmd.handle], vk::Fence::null())
                });
            batch.commands.lock().yield_buffer(batch.cmd);
            result?;
        }

        self.apply_transfers();
        Ok(())
    }

    #[cfg(feature = "async-buffer-update")]
    fn apply_transfers(&mut self) {
        for copy in self.transfers.drain(..) {
            // SAFETY: check_in_copy's contract keeps `dst` valid until now, and
            // the staging region is live until the next staging reset.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    copy.region.mapped.as_ptr(),
                    copy.dst.as_ptr(),
                    copy.region.size as usize,
                );
            }
        }
    }

    #[cfg(not(feature = "async-buffer-update"))]
    fn apply_transfers(&mut self) {}

    /// Number of copies waiting for [`depart`](Self::depart).
    pub fn pending_copies(&self) -> usize {
        #[cfg(feature = "async-buffer-update")]
        let pending = self.transfers.len();
        #[cfg(not(feature = "async-buffer-update"))]
        let pending = 0;
        pending
    }

    /// Whether nothing is waiting to be submitted or copied.
    pub fn is_empty(&self) -> bool {
        self.batch.is_none() && self.pending_copies() == 0
    }
}

impl Drop for TransportHub {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            tracing::warn!("Transport hub dropped with an open batch.");
            batch.commands.lock().yield_buffer(batch.cmd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BufferDesc;
    use crate::mock::MockDevice;
    use ash::vk::Handle;
    use gpu_allocator::MemoryLocation;
    use std::sync::atomic::Ordering;

    struct Fixture {
        mock: Arc<MockDevice>,
        device: Arc<DeviceContext>,
        commands: Arc<Mutex<CommandBufferPool>>,
        fences: Mutex<FencePool>,
        queue: Mutex<GpuQueue>,
        hub: TransportHub,
    }

    impl Fixture {
        fn new() -> Self {
            let (mock, device) = MockDevice::pair(2);
            let queue = GpuQueue::new(
                device.clone(),
                vk::Queue::from_raw(0x51),
                0,
                vk::PipelineStageFlags::TRANSFER,
            )
            .unwrap();
            Self {
                commands: Arc::new(Mutex::new(CommandBufferPool::new(device.clone()))),
                fences: Mutex::new(FencePool::new(device.clone())),
                queue: Mutex::new(queue),
                hub: TransportHub::new(device.clone(), 0, 1_000_000),
                mock,
                device,
            }
        }

        fn check_in(&mut self, immediate: bool) -> vk::CommandBuffer {
            let links = TransportLinks {
                context: ContextId::MAIN,
                commands: &self.commands,
                fences: &self.fences,
                queue: &self.queue,
            };
            let mut recorded = vk::CommandBuffer::null();
            self.hub
                .check_in(&links, |cmd| recorded = cmd, immediate)
                .unwrap();
            recorded
        }
    }

    #[test]
    fn batched_check_ins_share_one_command_buffer() {
        let mut fx = Fixture::new();

        let first = fx.check_in(false);
        let second = fx.check_in(false);
        assert_eq!(first, second);
        assert!(!fx.hub.is_empty());
        assert!(fx.mock.state().submissions.is_empty());

        fx.hub.depart(&fx.queue).unwrap();
        assert!(fx.hub.is_empty());

        let state = fx.mock.state();
        assert_eq!(state.begun, vec![first]);
        assert_eq!(state.ended, vec![first]);
        assert_eq!(state.submissions.len(), 1);
        assert_eq!(state.submissions[0].command_buffers, vec![first]);
        assert_eq!(state.submissions[0].signal_semaphores.len(), 1);
        assert_eq!(state.fence_waits, 0);
    }

    #[test]
    fn immediate_check_in_submits_and_waits() {
        let mut fx = Fixture::new();

        let cmd = fx.check_in(true);
        assert!(fx.hub.is_empty());
        {
            let state = fx.mock.state();
            assert_eq!(state.submissions.len(), 1);
            assert!(state.submissions[0].signal_semaphores.is_empty());
            assert_ne!(state.submissions[0].fence, vk::Fence::null());
            assert_eq!(state.fence_waits, 1);
        }
        assert_eq!(fx.fences.lock().size(), 1);

        // Nothing left to depart
        fx.hub.depart(&fx.queue).unwrap();
        assert_eq!(fx.mock.state().submissions.len(), 1);

        // The yielded buffer comes back once its slot recurs
        fx.device.advance_back_buffer();
        let other_slot = fx.check_in(false);
        assert_ne!(other_slot, cmd);
        fx.hub.depart(&fx.queue).unwrap();
        fx.device.advance_back_buffer();
        let again = fx.check_in(false);
        assert_eq!(again, cmd);
    }

    #[test]
    fn immediate_timeout_is_device_lost_and_releases_buffer() {
        let mut fx = Fixture::new();
        fx.mock.time_out_waits.store(true, Ordering::Relaxed);

        let links = TransportLinks {
            context: ContextId::MAIN,
            commands: &fx.commands,
            fences: &fx.fences,
            queue: &fx.queue,
        };
        let err = fx.hub.check_in(&links, |_| {}, true).unwrap_err();

        assert!(err.is_device_lost());
        assert!(fx.hub.is_empty());
    }

    #[cfg(not(feature = "async-buffer-update"))]
    #[test]
    fn copies_land_immediately() {
        let mut fx = Fixture::new();
        let mut staging = StagingBufferPool::new(fx.device.clone(), 1024);
        let target = fx
            .device
            .raw()
            .create_buffer(&BufferDesc {
                size: 16,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                location: MemoryLocation::CpuToGpu,
                name: "target",
            })
            .unwrap();
        let dst = target.mapped.unwrap();

        unsafe {
            fx.hub
                .check_in_pod(dst, &[1u32, 2, 3, 4], &mut staging)
                .unwrap();
        }

        let bytes = unsafe { std::slice::from_raw_parts(dst.as_ptr(), 16) };
        assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[1, 2, 3, 4]));
        assert_eq!(staging.chunk_count(), 0);
        assert_eq!(fx.hub.pending_copies(), 0);
    }

    #[cfg(feature = "async-buffer-update")]
    #[test]
    fn copies_are_staged_until_depart() {
        let mut fx = Fixture::new();
        let mut staging = StagingBufferPool::new(fx.device.clone(), 1024);
        let target = fx
            .device
            .raw()
            .create_buffer(&BufferDesc {
                size: 4,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                location: MemoryLocation::CpuToGpu,
                name: "target",
            })
            .unwrap();
        let dst = target.mapped.unwrap();

        unsafe {
            fx.hub.check_in_copy(dst, &[9, 8, 7, 6], &mut staging).unwrap();
        }
        let bytes = || unsafe { std::slice::from_raw_parts(dst.as_ptr(), 4).to_vec() };
        assert_eq!(bytes(), vec![0, 0, 0, 0]);
        assert_eq!(fx.hub.pending_copies(), 1);

        fx.hub.depart(&fx.queue).unwrap();
        assert_eq!(bytes(), vec![9, 8, 7, 6]);
        assert!(fx.hub.is_empty());
    }
}
