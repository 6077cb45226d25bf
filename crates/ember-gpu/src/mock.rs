//! Recording [`RawDevice`] used by the unit tests.

use crate::capabilities::GpuCapabilities;
use crate::descriptors::DescriptorInfo;
use crate::device::{
    AllocationId, BufferAllocation, BufferDesc, DeviceContext, ImageAllocation, MappedPtr,
    RawDevice, Submission,
};
use crate::error::{GpuError, Result};
use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MockSubmission {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

#[derive(Default)]
pub struct MockState {
    pub fences_created: usize,
    pub fence_resets: Vec<Vec<vk::Fence>>,
    pub fence_waits: usize,
    pub semaphores_created: usize,
    pub command_pools_created: usize,
    pub command_buffers_allocated: usize,
    pub command_pool_resets: Vec<vk::CommandPool>,
    pub begun: Vec<vk::CommandBuffer>,
    pub ended: Vec<vk::CommandBuffer>,
    pub submissions: Vec<MockSubmission>,
    pub descriptor_pools_created: Vec<(u32, Vec<vk::DescriptorPoolSize>)>,
    pub written_sets: Vec<vk::DescriptorSet>,
    pub template_updates: Vec<(vk::DescriptorSet, vk::DescriptorUpdateTemplate)>,
    pub buffers_created: usize,
    pub destroyed: Vec<(&'static str, u64)>,
    pub idle_waits: usize,
    memory: HashMap<AllocationId, Box<[u8]>>,
}

impl MockState {
    pub fn destroyed_count(&self, kind: &str) -> usize {
        self.destroyed.iter().filter(|(k, _)| *k == kind).count()
    }
}

#[derive(Default)]
pub struct MockDevice {
    next_handle: AtomicU64,
    state: Mutex<MockState>,
    pub fail_fence_creation: AtomicBool,
    pub time_out_waits: AtomicBool,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(1),
            ..Default::default()
        })
    }

    /// A fresh mock wrapped in a device context.
    pub fn context(back_buffer_count: u32) -> Arc<DeviceContext> {
        Self::pair(back_buffer_count).1
    }

    pub fn pair(back_buffer_count: u32) -> (Arc<Self>, Arc<DeviceContext>) {
        Self::pair_with(back_buffer_count, GpuCapabilities::default())
    }

    pub fn pair_with(
        back_buffer_count: u32,
        capabilities: GpuCapabilities,
    ) -> (Arc<Self>, Arc<DeviceContext>) {
        let mock = Self::new();
        let raw: Arc<dyn RawDevice> = mock.clone();
        let context = Arc::new(DeviceContext::new(raw, capabilities, back_buffer_count));
        (mock, context)
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn destroyed(&self, kind: &'static str, raw: u64) {
        self.state.lock().destroyed.push((kind, raw));
    }

    fn allocate_memory(&self, size: u64, host_visible: bool) -> (AllocationId, Option<MappedPtr>) {
        let id = AllocationId(self.next());
        let mut memory = vec![0u8; if host_visible { size as usize } else { 0 }].into_boxed_slice();
        let mapped = host_visible
            .then(|| NonNull::new(memory.as_mut_ptr()).map(MappedPtr::new))
            .flatten();
        self.state.lock().memory.insert(id, memory);
        (id, mapped)
    }
}

impl RawDevice for MockDevice {
    fn create_fence(&self, _signaled: bool) -> Result<vk::Fence> {
        if self.fail_fence_creation.load(Ordering::Relaxed) {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        self.state.lock().fences_created += 1;
        Ok(vk::Fence::from_raw(self.next()))
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        self.state.lock().fence_resets.push(fences.to_vec());
        Ok(())
    }

    fn wait_for_fences(&self, _fences: &[vk::Fence], _timeout_ns: u64) -> Result<()> {
        self.state.lock().fence_waits += 1;
        if self.time_out_waits.load(Ordering::Relaxed) {
            return Err(GpuError::Vulkan(vk::Result::TIMEOUT));
        }
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.destroyed("fence", fence.as_raw());
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        self.state.lock().semaphores_created += 1;
        Ok(vk::Semaphore::from_raw(self.next()))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.destroyed("semaphore", semaphore.as_raw());
    }

    fn create_command_pool(
        &self,
        _queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        self.state.lock().command_pools_created += 1;
        Ok(vk::CommandPool::from_raw(self.next()))
    }

    fn allocate_command_buffers(
        &self,
        _pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        self.state.lock().command_buffers_allocated += count as usize;
        Ok((0..count)
            .map(|_| vk::CommandBuffer::from_raw(self.next()))
            .collect())
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        self.state.lock().command_pool_resets.push(pool);
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.destroyed("command_pool", pool.as_raw());
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        self.state.lock().begun.push(cmd);
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.state.lock().ended.push(cmd);
        Ok(())
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> Result<()> {
        self.state.lock().submissions.push(MockSubmission {
            queue,
            command_buffers: submission.command_buffers.to_vec(),
            wait_semaphores: submission.wait_semaphores.to_vec(),
            signal_semaphores: submission.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        self.state
            .lock()
            .descriptor_pools_created
            .push((max_sets, pool_sizes.to_vec()));
        Ok(vk::DescriptorPool::from_raw(self.next()))
    }

    fn allocate_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        Ok(layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(self.next()))
            .collect())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.destroyed("descriptor_pool", pool.as_raw());
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let mut state = self.state.lock();
        state.written_sets.extend(writes.iter().map(|w| w.dst_set));
    }

    fn update_descriptor_set_with_template(
        &self,
        set: vk::DescriptorSet,
        template: vk::DescriptorUpdateTemplate,
        _infos: &[DescriptorInfo],
    ) {
        self.state.lock().template_updates.push((set, template));
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferAllocation> {
        let host_visible = !matches!(desc.location, MemoryLocation::GpuOnly);
        let (allocation, mapped) = self.allocate_memory(desc.size, host_visible);
        self.state.lock().buffers_created += 1;
        Ok(BufferAllocation {
            buffer: vk::Buffer::from_raw(self.next()),
            allocation,
            size: desc.size,
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationId) -> Result<()> {
        let mut state = self.state.lock();
        state.memory.remove(&allocation);
        state.destroyed.push(("buffer", buffer.as_raw()));
        Ok(())
    }

    fn create_image(
        &self,
        _info: &vk::ImageCreateInfo<'_>,
        _location: MemoryLocation,
        _name: &str,
    ) -> Result<ImageAllocation> {
        let (allocation, _) = self.allocate_memory(0, false);
        Ok(ImageAllocation {
            image: vk::Image::from_raw(self.next()),
            allocation,
        })
    }

    fn destroy_image(&self, image: vk::Image, allocation: AllocationId) -> Result<()> {
        let mut state = self.state.lock();
        state.memory.remove(&allocation);
        state.destroyed.push(("image", image.as_raw()));
        Ok(())
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.destroyed("image_view", view.as_raw());
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.destroyed("render_pass", render_pass.as_raw());
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.destroyed("framebuffer", framebuffer.as_raw());
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.destroyed("sampler", sampler.as_raw());
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.destroyed("shader_module", module.as_raw());
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.destroyed("descriptor_set_layout", layout.as_raw());
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.destroyed("pipeline_layout", layout.as_raw());
    }

    fn destroy_descriptor_update_template(&self, template: vk::DescriptorUpdateTemplate) {
        self.destroyed("update_template", template.as_raw());
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.destroyed("pipeline", pipeline.as_raw());
    }

    fn wait_idle(&self) -> Result<()> {
        self.state.lock().idle_waits += 1;
        Ok(())
    }
}
