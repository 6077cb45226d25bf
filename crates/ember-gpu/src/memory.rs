//! GPU memory management.

use crate::device::{AllocationId, BufferAllocation, BufferDesc, ImageAllocation, MappedPtr};
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

/// GPU memory allocator wrapper.
///
/// Allocations stay owned by the allocator and are referred to by
/// [`AllocationId`], so destruction records only carry plain handles.
pub struct GpuAllocator {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
    allocations: HashMap<AllocationId, Allocation>,
    next_id: u64,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
            allocations: HashMap::new(),
            next_id: 1,
        })
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    fn release(&mut self, allocation: Allocation) -> Result<()> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    fn track(&mut self, allocation: Allocation) -> AllocationId {
        let id = AllocationId(self.next_id);
        self.next_id += 1;
        self.allocations.insert(id, allocation);
        id
    }

    /// Allocate a buffer and bind memory to it.
    pub fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<BufferAllocation> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(desc.name, requirements, desc.location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.release(allocation)?;
            return Err(e.into());
        }

        let mapped = allocation
            .mapped_ptr()
            .and_then(|p| NonNull::new(p.as_ptr().cast::<u8>()))
            .map(MappedPtr::new);

        Ok(BufferAllocation {
            buffer,
            allocation: self.track(allocation),
            size: desc.size,
            mapped,
        })
    }

    /// Destroy a buffer and free its memory.
    pub fn free_buffer(&mut self, buffer: vk::Buffer, id: AllocationId) -> Result<()> {
        unsafe { self.device.destroy_buffer(buffer, None) };
        self.free(id)
    }

    /// Allocate an image and bind memory to it.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> Result<ImageAllocation> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let linear = create_info.tiling == vk::ImageTiling::LINEAR;
        let allocation = match self.allocate(name, requirements, location, linear) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_image(image, None) };
            self.release(allocation)?;
            return Err(e.into());
        }

        Ok(ImageAllocation {
            image,
            allocation: self.track(allocation),
        })
    }

    /// Destroy an image and free its memory.
    pub fn free_image(&mut self, image: vk::Image, id: AllocationId) -> Result<()> {
        unsafe { self.device.destroy_image(image, None) };
        self.free(id)
    }

    fn free(&mut self, id: AllocationId) -> Result<()> {
        let allocation = self
            .allocations
            .remove(&id)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("allocation {}", id.0)))?;
        self.release(allocation)
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&mut self) {
        if !self.allocations.is_empty() {
            tracing::warn!("Leaked {} GPU allocations.", self.allocations.len());
        }
        let leaked: Vec<_> = self.allocations.drain().map(|(_, a)| a).collect();
        for allocation in leaked {
            if let Err(e) = self.release(allocation) {
                tracing::warn!("failed to free leaked allocation: {e}");
            }
        }
        self.allocator = None;
    }
}

impl Drop for GpuAllocator {
    fn drop(&mut self) {
        // Shutdown if not already done
        self.shutdown();
    }
}
