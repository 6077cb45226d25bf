//! Pooled transient GPU objects for a Vulkan backend.
//!
//! This crate provides:
//! - Fence, semaphore, command buffer, staging and descriptor set pools
//!   multi-buffered over N back-buffer slots
//! - Descriptor maintenance that follows resource reallocation
//! - Deferred destruction of objects that in-flight work may still use
//! - Batched host to device uploads
//! - Vulkan instance and device management via ash and gpu-allocator

pub mod capabilities;
pub mod command;
pub mod config;
pub mod context;
pub mod descriptor_hub;
pub mod descriptor_set_hub;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod memory;
pub mod queue;
pub mod recycle;
pub mod registry;
pub mod resources;
pub mod staging;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod mock;

pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{CommandBuffer, CommandBufferDesc, CommandBufferPool};
pub use config::ResourceConfig;
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptor_hub::{
    BufferViewSource, DescriptorHub, DescriptorRecord, DescriptorSource, ResourceKey,
    SamplerSource, TextureViewSource,
};
pub use descriptor_set_hub::DescriptorSetHub;
pub use descriptors::{
    DescriptorInfo, DescriptorSetId, DescriptorSetLayoutBuilder, DescriptorSetPool,
    DescriptorWrite, GpuDescriptorSet, SharedDescriptorSet,
};
pub use device::{
    AllocationId, BufferAllocation, BufferDesc, DeviceContext, ImageAllocation, MappedPtr,
    RawDevice, Submission,
};
pub use error::{GpuError, Result};
pub use memory::GpuAllocator;
pub use queue::GpuQueue;
pub use recycle::{RecycleBin, RecycledResource};
pub use registry::{ContextId, ContextRegistry};
pub use resources::GpuResources;
pub use staging::{StagingBufferPool, StagingRegion};
pub use sync::{wait_for_fence, FencePool, SemaphorePool};
pub use transport::{TransportHub, TransportLinks};
