//! Native device boundary and the shared device context.
//!
//! Every pool in this crate talks to the GPU through [`RawDevice`]. The
//! production implementation is [`GpuContext`](crate::context::GpuContext);
//! tests drive the pools with a recording mock instead.

use crate::capabilities::GpuCapabilities;
use crate::descriptors::DescriptorInfo;
use crate::error::Result;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Opaque handle of a memory allocation owned by the device's allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

/// Host pointer into persistently mapped device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer refers to mapped memory that lives as long as its
// allocation; ordering host writes against GPU reads is the caller's contract.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    /// Wrap a mapped pointer.
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Get the raw pointer.
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Offset the pointer by `offset` bytes.
    ///
    /// # Safety
    /// The result must stay inside the mapped allocation.
    pub unsafe fn add(self, offset: usize) -> Self {
        Self(unsafe { NonNull::new_unchecked(self.0.as_ptr().add(offset)) })
    }
}

/// Parameters for a buffer allocation.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

/// A buffer together with the allocation backing it.
#[derive(Debug, Clone, Copy)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub allocation: AllocationId,
    pub size: u64,
    /// Present when the buffer lives in host-visible memory.
    pub mapped: Option<MappedPtr>,
}

/// An image together with the allocation backing it.
#[derive(Debug, Clone, Copy)]
pub struct ImageAllocation {
    pub image: vk::Image,
    pub allocation: AllocationId,
}

/// One queue submission batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Submission<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// Native operations consumed by the pools.
///
/// Handles passed back into a `RawDevice` must have been created by that same
/// device. Destruction calls must only be issued once no in-flight GPU work
/// references the handle.
pub trait RawDevice: Send + Sync {
    // Synchronization
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()>;
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<()>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Command buffers
    fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool>;
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> Result<()>;

    // Descriptors
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool>;
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]);
    fn update_descriptor_set_with_template(
        &self,
        set: vk::DescriptorSet,
        template: vk::DescriptorUpdateTemplate,
        infos: &[DescriptorInfo],
    );

    // Memory
    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<BufferAllocation>;
    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: AllocationId) -> Result<()>;
    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> Result<ImageAllocation>;
    fn destroy_image(&self, image: vk::Image, allocation: AllocationId) -> Result<()>;

    // Plain object destruction
    fn destroy_image_view(&self, view: vk::ImageView);
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn destroy_sampler(&self, sampler: vk::Sampler);
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn destroy_descriptor_update_template(&self, template: vk::DescriptorUpdateTemplate);
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Block until the device has finished all submitted work.
    fn wait_idle(&self) -> Result<()>;
}

/// Device-wide state shared by every pool.
///
/// Pools hold an `Arc<DeviceContext>` purely as a context handle; the device
/// owns the pools, never the other way around.
pub struct DeviceContext {
    raw: Arc<dyn RawDevice>,
    capabilities: GpuCapabilities,
    back_buffer_count: u32,
    back_buffer_index: AtomicU32,
}

impl DeviceContext {
    /// Create a context with `back_buffer_count` frames in flight.
    pub fn new(
        raw: Arc<dyn RawDevice>,
        capabilities: GpuCapabilities,
        back_buffer_count: u32,
    ) -> Self {
        Self {
            raw,
            capabilities,
            back_buffer_count: back_buffer_count.max(1),
            back_buffer_index: AtomicU32::new(0),
        }
    }

    /// Get the native device.
    pub fn raw(&self) -> &dyn RawDevice {
        self.raw.as_ref()
    }

    /// Get the capabilities queried at initialization.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Number of back-buffer slots.
    pub fn back_buffer_count(&self) -> u32 {
        self.back_buffer_count
    }

    /// Slot currently being recorded.
    pub fn back_buffer_index(&self) -> u32 {
        self.back_buffer_index.load(Ordering::Acquire)
    }

    /// Move to the next back-buffer slot and return it.
    ///
    /// Only the frame-advance step may call this, after every consumer of the
    /// previous slot is done with it.
    pub fn advance_back_buffer(&self) -> u32 {
        let next = (self.back_buffer_index() + 1) % self.back_buffer_count;
        self.back_buffer_index.store(next, Ordering::Release);
        next
    }
}
