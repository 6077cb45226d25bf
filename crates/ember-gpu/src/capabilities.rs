//! GPU capability detection.
//!
//! Queried once when the device is created and handed to consumers by
//! reference through [`DeviceContext`](crate::device::DeviceContext).

use ash::vk;
use hashbrown::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Descriptor sets can be updated through `VkDescriptorUpdateTemplate`
    pub supports_descriptor_update_template: bool,
    /// Indirect draws may carry more than one draw
    pub supports_multi_draw_indirect: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Required alignment for uniform buffer offsets
    pub min_uniform_buffer_offset_alignment: u64,
    /// Required alignment for buffer-to-image copy offsets
    pub optimal_buffer_copy_offset_alignment: u64,

    pub available_extensions: HashSet<String>,
}

impl Default for GpuCapabilities {
    fn default() -> Self {
        Self {
            vendor: GpuVendor::Other(0),
            device_name: String::new(),
            api_version: vk::API_VERSION_1_1,
            driver_version: 0,
            supports_descriptor_update_template: false,
            supports_multi_draw_indirect: false,
            device_local_memory_mb: 0,
            min_uniform_buffer_offset_alignment: 1,
            optimal_buffer_copy_offset_alignment: 1,
            available_extensions: HashSet::new(),
        }
    }
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        // Update templates are core since 1.1
        let api_version = properties.api_version;
        let has_vulkan_1_1 = vk::api_version_major(api_version) > 1
            || vk::api_version_minor(api_version) >= 1;

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_descriptor_update_template: has_vulkan_1_1
                || available_extensions.contains("VK_KHR_descriptor_update_template"),
            supports_multi_draw_indirect: features.multi_draw_indirect == vk::TRUE,

            device_local_memory_mb,
            min_uniform_buffer_offset_alignment: properties
                .limits
                .min_uniform_buffer_offset_alignment,
            optimal_buffer_copy_offset_alignment: properties
                .limits
                .optimal_buffer_copy_offset_alignment,

            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        api_major > 1 || (api_major == 1 && api_minor >= 1)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}
