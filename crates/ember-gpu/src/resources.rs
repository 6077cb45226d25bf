//! Device-owned aggregate of every resource pool and hub.

use crate::command::{CommandBuffer, CommandBufferDesc, CommandBufferPool};
use crate::config::ResourceConfig;
use crate::descriptor_hub::{DescriptorHub, DescriptorRecord, DescriptorSource};
use crate::descriptor_set_hub::DescriptorSetHub;
use crate::descriptors::{
    DescriptorSetPool, DescriptorWrite, GpuDescriptorSet, SharedDescriptorSet,
};
use crate::device::{DeviceContext, MappedPtr};
use crate::error::{GpuError, Result};
use crate::queue::GpuQueue;
use crate::recycle::{RecycleBin, RecycledResource};
use crate::registry::{ContextId, ContextRegistry};
use crate::staging::{StagingBufferPool, StagingRegion};
use crate::sync::{wait_for_fence, FencePool, SemaphorePool};
use crate::transport::{TransportHub, TransportLinks};
use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Every transient GPU object pool of one device.
///
/// Command buffer and staging pools exist once per [`ContextId`]; everything
/// else is shared and serialized by its own lock. Nested locks are always
/// taken in the order transport, command pool, staging pool, fence pool,
/// queue.
pub struct GpuResources {
    device: Arc<DeviceContext>,
    config: ResourceConfig,
    queue_family: u32,
    transport: Mutex<TransportHub>,
    descriptor_hub: Mutex<DescriptorHub>,
    descriptor_set_hub: Mutex<DescriptorSetHub>,
    descriptor_set_pools: Mutex<HashMap<vk::DescriptorSetLayout, DescriptorSetPool>>,
    command_pools: ContextRegistry<CommandBufferPool>,
    staging_pools: ContextRegistry<StagingBufferPool>,
    fences: Mutex<FencePool>,
    semaphores: Mutex<SemaphorePool>,
    queue: Mutex<GpuQueue>,
    recycle_bin: Mutex<RecycleBin>,
}

impl GpuResources {
    /// Build every pool for `device`, submitting to `queue` of `queue_family`.
    ///
    /// `config.back_buffer_count` must match the slot count of `device`.
    pub fn new(
        device: Arc<DeviceContext>,
        queue: vk::Queue,
        queue_family: u32,
        config: ResourceConfig,
    ) -> Result<Self> {
        if config.back_buffer_count != device.back_buffer_count() {
            return Err(GpuError::InvalidState(format!(
                "configured for {} back buffers but the device cycles {}",
                config.back_buffer_count,
                device.back_buffer_count()
            )));
        }

        let queue = GpuQueue::new(
            device.clone(),
            queue,
            queue_family,
            vk::PipelineStageFlags::ALL_COMMANDS,
        )?;

        tracing::debug!(
            back_buffers = device.back_buffer_count(),
            queue_family,
            "GPU resource pools created"
        );

        Ok(Self {
            transport: Mutex::new(TransportHub::new(
                device.clone(),
                queue_family,
                config.fence_timeout_ns(),
            )),
            descriptor_hub: Mutex::new(DescriptorHub::new()),
            descriptor_set_hub: Mutex::new(DescriptorSetHub::new(device.clone())),
            descriptor_set_pools: Mutex::new(HashMap::new()),
            command_pools: ContextRegistry::new(),
            staging_pools: ContextRegistry::new(),
            fences: Mutex::new(FencePool::new(device.clone())),
            semaphores: Mutex::new(SemaphorePool::new(device.clone())),
            queue: Mutex::new(queue),
            recycle_bin: Mutex::new(RecycleBin::new(
                device.clone(),
                config.recycle_bin_capacity,
            )),
            device,
            config,
            queue_family,
        })
    }

    /// Device the pools allocate from.
    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn command_pool(&self, context: ContextId) -> Arc<Mutex<CommandBufferPool>> {
        self.command_pools
            .get_or_insert_with(context, || CommandBufferPool::new(self.device.clone()))
    }

    fn staging_pool(&self, context: ContextId) -> Arc<Mutex<StagingBufferPool>> {
        self.staging_pools.get_or_insert_with(context, || {
            StagingBufferPool::new(self.device.clone(), self.config.staging_chunk_size)
        })
    }

    // Command buffers

    pub fn request_command_buffer(
        &self,
        context: ContextId,
        desc: CommandBufferDesc,
    ) -> Result<CommandBuffer> {
        self.command_pool(context).lock().request(desc)
    }

    pub fn yield_command_buffer(&self, context: ContextId, buffer: CommandBuffer) {
        self.command_pool(context).lock().yield_buffer(buffer);
    }

    // Synchronization

    pub fn alloc_fence(&self) -> Result<vk::Fence> {
        self.fences.lock().alloc()
    }

    /// Wait for `fence` with the configured timeout.
    pub fn wait_fence(&self, fence: vk::Fence) -> Result<()> {
        wait_for_fence(self.device.raw(), fence, self.config.fence_timeout_ns())
    }

    pub fn alloc_semaphore(&self) -> Result<vk::Semaphore> {
        self.semaphores.lock().alloc()
    }

    pub fn reset_fence_pool(&self) -> Result<()> {
        self.fences.lock().reset()
    }

    pub fn reset_semaphore_pool(&self) {
        self.semaphores.lock().reset();
    }

    // Staging

    pub fn alloc_staging_region(
        &self,
        context: ContextId,
        size: u64,
        alignment: u64,
    ) -> Result<StagingRegion> {
        self.staging_pool(context).lock().alloc(size, alignment)
    }

    // Descriptor sets

    /// Create the set pool of `layout`. Relinking an existing pool is ignored.
    pub fn link_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) {
        let mut pools = self.descriptor_set_pools.lock();
        if pools.contains_key(&layout) {
            tracing::warn!(?layout, "descriptor set layout linked twice");
            return;
        }

        let mut pool = DescriptorSetPool::new(self.device.clone());
        pool.link(self.config.descriptor_sets_per_pool, bindings, layout);
        pools.insert(layout, pool);
    }

    pub fn request_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        self.descriptor_set_pools
            .lock()
            .get_mut(&layout)
            .ok_or_else(|| unlinked(layout))?
            .request()
    }

    pub fn yield_descriptor_set(&self, layout: vk::DescriptorSetLayout, set: vk::DescriptorSet) {
        match self.descriptor_set_pools.lock().get_mut(&layout) {
            Some(pool) => pool.yield_set(set),
            None => tracing::warn!(?layout, "yielded descriptor set of an unknown layout"),
        }
    }

    /// Create a descriptor set with one native set per back-buffer slot.
    pub fn create_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        writes: Vec<DescriptorWrite>,
    ) -> Result<SharedDescriptorSet> {
        let mut pools = self.descriptor_set_pools.lock();
        let pool = pools.get_mut(&layout).ok_or_else(|| unlinked(layout))?;

        let slots = self.device.back_buffer_count() as usize;
        let mut sets = Vec::with_capacity(slots);
        for _ in 0..slots {
            match pool.request() {
                Ok(set) => sets.push(set),
                Err(e) => {
                    for set in sets {
                        pool.yield_set(set);
                    }
                    return Err(e);
                }
            }
        }

        Ok(GpuDescriptorSet::new(layout, sets, writes).into_shared())
    }

    /// Stop tracking `set` and return its native sets to their pool.
    pub fn retire_descriptor_set(&self, set: &SharedDescriptorSet) {
        let (id, layout, natives) = {
            let set = set.lock();
            (set.id(), set.layout(), set.sets().to_vec())
        };

        self.descriptor_hub.lock().disengage_set(id);
        self.descriptor_set_hub.lock().forget(id);
        for native in natives {
            self.yield_descriptor_set(layout, native);
        }
    }

    // Descriptor data

    /// Make write `index` of `set` follow `source`, and fill it in now.
    pub fn connect_descriptor<S: DescriptorSource + ?Sized>(
        &self,
        source: &S,
        set: &SharedDescriptorSet,
        index: usize,
    ) -> DescriptorRecord {
        let record = DescriptorRecord::new(set, index);
        let mut hub = self.descriptor_hub.lock();
        hub.connect(source, record.clone());
        hub.update(source, Some(&record));
        record
    }

    /// Push the current state of `source` into every dependent set.
    pub fn update_descriptors<S: DescriptorSource + ?Sized>(&self, source: &S) {
        let sets = {
            let hub = self.descriptor_hub.lock();
            hub.update(source, None);
            hub.sets_of(source.key())
        };

        let mut set_hub = self.descriptor_set_hub.lock();
        for set in &sets {
            set_hub.record(set);
        }
    }

    pub fn disengage_descriptor<S: DescriptorSource + ?Sized>(
        &self,
        source: &S,
        record: Option<&DescriptorRecord>,
    ) {
        self.descriptor_hub.lock().disengage(source, record);
    }

    /// Apply the writes of `set` now and schedule them for the other slots.
    pub fn record_descriptor_write(&self, set: &SharedDescriptorSet) {
        self.descriptor_set_hub.lock().record(set);
    }

    /// Apply the pending writes of the current slot.
    pub fn flush_descriptor_updates(&self) {
        self.descriptor_set_hub.lock().flush();
    }

    // Destruction

    /// Destroy `resource` at the next drain.
    pub fn recycle(&self, resource: RecycledResource) {
        self.recycle_bin.lock().collect(resource);
    }

    /// Destroy `layout` and its linked set pool at the next drain.
    pub fn retire_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let sets = self.descriptor_set_pools.lock().remove(&layout);
        self.recycle(RecycledResource::DescriptorSetLayout { layout, sets });
    }

    /// Wait for the device to go idle and destroy everything recycled.
    pub fn drain_recycle_bin(&self) -> Result<()> {
        self.device.raw().wait_idle()?;
        self.recycle_bin.lock().clear()
    }

    // Transport

    /// Record upload commands from `context`, see [`TransportHub::check_in`].
    pub fn transport_check_in(
        &self,
        context: ContextId,
        record: impl FnOnce(vk::CommandBuffer),
        immediate: bool,
    ) -> Result<()> {
        let mut transport = self.transport.lock();
        let commands = self.command_pool(context);
        let links = TransportLinks {
            context,
            commands: &commands,
            fences: &self.fences,
            queue: &self.queue,
        };
        transport.check_in(&links, record, immediate)
    }

    /// Copy `src` into mapped memory at `dst` through the transport hub.
    ///
    /// # Safety
    /// See [`TransportHub::check_in_copy`].
    pub unsafe fn transport_copy(
        &self,
        context: ContextId,
        dst: MappedPtr,
        src: &[u8],
    ) -> Result<()> {
        let mut transport = self.transport.lock();
        let staging = self.staging_pool(context);
        let mut staging = staging.lock();
        unsafe { transport.check_in_copy(dst, src, &mut staging) }
    }

    pub fn transport_depart(&self) -> Result<()> {
        self.transport.lock().depart(&self.queue)
    }

    // Submission

    /// Submit in order with all earlier work and wait for completion.
    ///
    /// Without a `fence` one is taken from the fence pool.
    pub fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        fence: Option<vk::Fence>,
    ) -> Result<()> {
        let fence = match fence {
            Some(fence) => fence,
            None => self.alloc_fence()?,
        };
        self.queue
            .lock()
            .submit(command_buffers, fence, self.config.fence_timeout_ns())
    }

    /// Finish the current frame and move to the next back-buffer slot.
    ///
    /// Submits pending uploads, waits for the device, destroys recycled
    /// objects, rewinds the per-frame pools and applies the descriptor writes
    /// pending for the new slot. Returns the new back-buffer index.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_frame(&self) -> Result<u32> {
        self.transport_depart()?;
        self.drain_recycle_bin()?;
        self.reset_fence_pool()?;
        self.reset_semaphore_pool();
        self.staging_pools.for_each(|_, pool| pool.reset());

        let index = self.device.advance_back_buffer();
        self.flush_descriptor_updates();
        Ok(index)
    }

    /// Number of recording contexts that own a command buffer pool.
    pub fn context_count(&self) -> usize {
        self.command_pools.len()
    }

    /// Number of objects waiting in the recycle bin.
    pub fn recycled_count(&self) -> usize {
        self.recycle_bin.lock().len()
    }

    /// Number of queue submissions so far.
    pub fn submission_count(&self) -> u64 {
        self.queue.lock().submission_count()
    }
}

fn unlinked(layout: vk::DescriptorSetLayout) -> GpuError {
    GpuError::ResourceNotFound(format!("no descriptor set pool linked for {layout:?}"))
}

impl Drop for GpuResources {
    fn drop(&mut self) {
        if let Err(e) = self.device.raw().wait_idle() {
            tracing::warn!("wait idle failed during teardown: {e}");
        }
        if let Err(e) = self.recycle_bin.get_mut().clear() {
            tracing::warn!("failed to drain recycle bin during teardown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor_hub::{BufferViewSource, ResourceKey};
    use crate::descriptors::DescriptorSetLayoutBuilder;
    use crate::device::BufferDesc;
    use crate::mock::MockDevice;
    use ash::vk::Handle;
    use gpu_allocator::MemoryLocation;

    fn resources(back_buffers: u32) -> (Arc<MockDevice>, GpuResources) {
        let (mock, device) = MockDevice::pair(back_buffers);
        let resources = GpuResources::new(
            device,
            vk::Queue::from_raw(0x51),
            0,
            ResourceConfig::new()
                .with_back_buffer_count(back_buffers)
                .with_staging_chunk_size(1024)
                .with_descriptor_sets_per_pool(4),
        )
        .unwrap();
        (mock, resources)
    }

    #[test]
    fn end_frame_departs_drains_and_advances() {
        let (mock, resources) = resources(3);

        resources
            .transport_check_in(ContextId::MAIN, |_| {}, false)
            .unwrap();
        let region = resources
            .alloc_staging_region(ContextId::MAIN, 100, 16)
            .unwrap();
        region.write(&[1; 100]).unwrap();
        resources.alloc_fence().unwrap();
        resources.recycle(RecycledResource::Sampler(vk::Sampler::from_raw(77)));

        let index = resources.end_frame().unwrap();

        assert_eq!(index, 1);
        assert_eq!(resources.submission_count(), 1);
        assert_eq!(resources.recycled_count(), 0);
        let state = mock.state();
        assert_eq!(state.idle_waits, 1);
        assert_eq!(state.fence_resets.len(), 1);
        assert_eq!(state.destroyed_count("sampler"), 1);
        drop(state);

        // Staging cursor was rewound
        let again = resources
            .alloc_staging_region(ContextId::MAIN, 100, 16)
            .unwrap();
        assert_eq!((again.chunk, again.offset), (region.chunk, region.offset));
    }

    #[test]
    fn contexts_get_their_own_command_pools() {
        let (mock, resources) = resources(2);

        let main = resources
            .request_command_buffer(ContextId::MAIN, CommandBufferDesc::primary(0))
            .unwrap();
        let worker = resources
            .request_command_buffer(ContextId::new(1), CommandBufferDesc::primary(0))
            .unwrap();

        assert_ne!(main.handle, worker.handle);
        assert_eq!(resources.context_count(), 2);
        assert_eq!(mock.state().command_pools_created, 2);
    }

    #[test]
    fn submit_without_fence_uses_pooled_fence_and_waits() {
        let (mock, resources) = resources(2);
        let cmd = resources
            .request_command_buffer(ContextId::MAIN, CommandBufferDesc::primary(0))
            .unwrap();

        resources.submit(&[cmd.handle], None).unwrap();

        let state = mock.state();
        assert_eq!(state.fences_created, 1);
        assert_eq!(state.fence_waits, 1);
        assert_eq!(state.submissions[0].command_buffers, vec![cmd.handle]);
    }

    #[test]
    fn descriptor_updates_follow_reallocated_buffers() {
        let (mock, resources) = resources(2);
        let layout = vk::DescriptorSetLayout::from_raw(0x1A);
        let builder =
            DescriptorSetLayoutBuilder::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX);
        resources.link_descriptor_set_layout(layout, builder.bindings());

        let set = resources
            .create_descriptor_set(layout, builder.writes())
            .unwrap();
        let natives = set.lock().sets().to_vec();
        assert_eq!(natives.len(), 2);

        let mut source = BufferViewSource {
            id: 3,
            buffer: vk::Buffer::from_raw(500),
            base_offset: 0,
            offset: 0,
            range: 64,
        };
        resources.connect_descriptor(&source, &set, 0);
        resources.record_descriptor_write(&set);
        assert_eq!(mock.state().written_sets, vec![natives[0]]);

        source.buffer = vk::Buffer::from_raw(600);
        resources.update_descriptors(&source);
        let info = unsafe { set.lock().infos()[0].buffer };
        assert_eq!(info.buffer, vk::Buffer::from_raw(600));
        assert_eq!(mock.state().written_sets, vec![natives[0], natives[0]]);

        // The other slot catches up once it becomes current
        resources.end_frame().unwrap();
        assert_eq!(
            mock.state().written_sets,
            vec![natives[0], natives[0], natives[1]]
        );
    }

    #[test]
    fn retired_descriptor_set_returns_to_its_pool() {
        let (_mock, resources) = resources(2);
        let layout = vk::DescriptorSetLayout::from_raw(0x1B);
        let builder =
            DescriptorSetLayoutBuilder::new().storage_buffer(0, vk::ShaderStageFlags::COMPUTE);
        resources.link_descriptor_set_layout(layout, builder.bindings());

        let set = resources
            .create_descriptor_set(layout, builder.writes())
            .unwrap();
        let source = BufferViewSource {
            id: 4,
            buffer: vk::Buffer::from_raw(1),
            base_offset: 0,
            offset: 0,
            range: 16,
        };
        resources.connect_descriptor(&source, &set, 0);
        resources.retire_descriptor_set(&set);

        assert_eq!(
            resources
                .descriptor_hub
                .lock()
                .record_count(ResourceKey::BufferView(4)),
            0
        );
        let pools = resources.descriptor_set_pools.lock();
        assert_eq!(pools[&layout].active_count(), 0);
        assert_eq!(pools[&layout].free_count(), 4);
    }

    #[test]
    fn unlinked_layout_is_not_found() {
        let (_mock, resources) = resources(2);
        let err = resources
            .request_descriptor_set(vk::DescriptorSetLayout::from_raw(5))
            .unwrap_err();
        assert!(matches!(err, GpuError::ResourceNotFound(_)));
    }

    #[test]
    fn retired_layout_takes_its_pool_along() {
        let (mock, resources) = resources(2);
        let layout = vk::DescriptorSetLayout::from_raw(0x1C);
        let builder =
            DescriptorSetLayoutBuilder::new().sampled_image(0, vk::ShaderStageFlags::FRAGMENT);
        resources.link_descriptor_set_layout(layout, builder.bindings());
        let set = resources.request_descriptor_set(layout).unwrap();
        resources.yield_descriptor_set(layout, set);

        resources.retire_descriptor_set_layout(layout);
        assert_eq!(mock.state().destroyed_count("descriptor_pool"), 0);

        resources.drain_recycle_bin().unwrap();
        let state = mock.state();
        assert_eq!(state.destroyed_count("descriptor_pool"), 1);
        assert_eq!(state.destroyed_count("descriptor_set_layout"), 1);
    }

    #[test]
    fn drop_waits_idle_and_drains_bin() {
        let (mock, resources) = resources(2);
        let buffer = resources
            .device()
            .raw()
            .create_buffer(&BufferDesc {
                size: 64,
                usage: vk::BufferUsageFlags::VERTEX_BUFFER,
                location: MemoryLocation::GpuOnly,
                name: "vertices",
            })
            .unwrap();
        resources.recycle(RecycledResource::Buffer {
            buffer: buffer.buffer,
            allocation: buffer.allocation,
        });

        drop(resources);

        let state = mock.state();
        assert_eq!(state.idle_waits, 1);
        assert_eq!(state.destroyed_count("buffer"), 1);
        // Chain semaphores go with the queue
        assert_eq!(state.destroyed_count("semaphore"), 2);
    }

    #[cfg(not(feature = "async-buffer-update"))]
    #[test]
    fn transport_copy_writes_through() {
        let (_mock, resources) = resources(2);
        let target = resources
            .device()
            .raw()
            .create_buffer(&BufferDesc {
                size: 4,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                location: MemoryLocation::CpuToGpu,
                name: "uniforms",
            })
            .unwrap();
        let dst = target.mapped.unwrap();

        unsafe {
            resources
                .transport_copy(ContextId::MAIN, dst, &[4, 3, 2, 1])
                .unwrap();
        }

        let bytes = unsafe { std::slice::from_raw_parts(dst.as_ptr(), 4) };
        assert_eq!(bytes, &[4, 3, 2, 1]);
    }

    #[test]
    fn mismatched_back_buffer_count_is_rejected() {
        let (_mock, device) = MockDevice::pair(2);
        let result = GpuResources::new(
            device,
            vk::Queue::from_raw(0x51),
            0,
            ResourceConfig::new().with_back_buffer_count(3),
        );
        assert!(matches!(result, Err(GpuError::InvalidState(_))));
    }

    #[test]
    fn contexts_stage_into_separate_chunks() {
        let (_mock, resources) = resources(2);
        let worker = ContextId::new(1);

        let main = resources
            .alloc_staging_region(ContextId::MAIN, 100, 16)
            .unwrap();
        let first = resources.alloc_staging_region(worker, 100, 16).unwrap();
        let second = resources.alloc_staging_region(worker, 100, 16).unwrap();

        assert_eq!((main.chunk, main.offset), (0, 0));
        assert_eq!((first.chunk, first.offset), (0, 0));
        assert_ne!(main.buffer, first.buffer);
        assert_eq!(second.buffer, first.buffer);
        assert_eq!(second.offset, 112);

        // Every context's staging pool is rewound at the frame boundary
        resources.end_frame().unwrap();
        let again = resources.alloc_staging_region(worker, 100, 16).unwrap();
        assert_eq!((again.chunk, again.offset), (0, 0));
        assert_eq!(again.buffer, first.buffer);
    }

    #[test]
    fn shared_transport_batch_returns_to_opening_context() {
        let (mock, resources) = resources(2);
        let worker = ContextId::new(1);

        let mut recorded = Vec::new();
        resources
            .transport_check_in(ContextId::MAIN, |cmd| recorded.push(cmd), false)
            .unwrap();
        resources
            .transport_check_in(worker, |cmd| recorded.push(cmd), false)
            .unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0], recorded[1]);

        resources.transport_depart().unwrap();
        assert_eq!(
            mock.state().submissions[0].command_buffers,
            vec![recorded[0]]
        );
        let worker_pool = resources.command_pools.get(worker).unwrap();
        assert_eq!(worker_pool.lock().native_pool_count(), 0);

        // Back in slot 0 the opener gets its buffer back without allocating
        resources.end_frame().unwrap();
        let cmd = resources
            .request_command_buffer(ContextId::MAIN, CommandBufferDesc::primary(0))
            .unwrap();
        resources.yield_command_buffer(ContextId::MAIN, cmd);
        resources.end_frame().unwrap();
        let reused = resources
            .request_command_buffer(ContextId::MAIN, CommandBufferDesc::primary(0))
            .unwrap();

        assert_eq!(reused.handle, recorded[0]);
        assert_eq!(mock.state().command_buffers_allocated, 2);
    }
}
