//! Deferred destruction of GPU objects.
//!
//! Objects dropped during a frame may still be referenced by in-flight work.
//! They are parked in the [`RecycleBin`] and only destroyed by
//! [`RecycleBin::clear`], which the owner calls once the device is idle.

use crate::descriptors::DescriptorSetPool;
use crate::device::{AllocationId, DeviceContext};
use crate::error::Result;
use ash::vk;
use std::fmt;
use std::sync::Arc;

/// A GPU object waiting for destruction, with just the handles needed to
/// destroy it.
pub enum RecycledResource {
    Buffer {
        buffer: vk::Buffer,
        allocation: AllocationId,
    },
    Image {
        image: vk::Image,
        allocation: AllocationId,
    },
    ImageView(vk::ImageView),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    Sampler(vk::Sampler),
    Shader {
        modules: Vec<vk::ShaderModule>,
    },
    /// A layout together with the set pool linked to it.
    DescriptorSetLayout {
        layout: vk::DescriptorSetLayout,
        sets: Option<DescriptorSetPool>,
    },
    PipelineLayout {
        layout: vk::PipelineLayout,
        update_templates: Vec<vk::DescriptorUpdateTemplate>,
    },
    PipelineState(vk::Pipeline),
    Fence(vk::Fence),
}

impl RecycledResource {
    fn kind(&self) -> &'static str {
        match self {
            Self::Buffer { .. } => "buffer",
            Self::Image { .. } => "image",
            Self::ImageView(_) => "image view",
            Self::RenderPass(_) => "render pass",
            Self::Framebuffer(_) => "framebuffer",
            Self::Sampler(_) => "sampler",
            Self::Shader { .. } => "shader",
            Self::DescriptorSetLayout { .. } => "descriptor set layout",
            Self::PipelineLayout { .. } => "pipeline layout",
            Self::PipelineState(_) => "pipeline state",
            Self::Fence(_) => "fence",
        }
    }

    fn destroy(self, device: &DeviceContext) -> Result<()> {
        let raw = device.raw();
        match self {
            Self::Buffer { buffer, allocation } => raw.destroy_buffer(buffer, allocation)?,
            Self::Image { image, allocation } => raw.destroy_image(image, allocation)?,
            Self::ImageView(view) => raw.destroy_image_view(view),
            Self::RenderPass(render_pass) => raw.destroy_render_pass(render_pass),
            Self::Framebuffer(framebuffer) => raw.destroy_framebuffer(framebuffer),
            Self::Sampler(sampler) => raw.destroy_sampler(sampler),
            Self::Shader { modules } => {
                for module in modules {
                    raw.destroy_shader_module(module);
                }
            }
            Self::DescriptorSetLayout { layout, sets } => {
                // Sets must go before their layout
                drop(sets);
                raw.destroy_descriptor_set_layout(layout);
            }
            Self::PipelineLayout {
                layout,
                update_templates,
            } => {
                for template in update_templates {
                    raw.destroy_descriptor_update_template(template);
                }
                raw.destroy_pipeline_layout(layout);
            }
            Self::PipelineState(pipeline) => raw.destroy_pipeline(pipeline),
            Self::Fence(fence) => raw.destroy_fence(fence),
        }
        Ok(())
    }
}

impl fmt::Debug for RecycledResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecycledResource").field(&self.kind()).finish()
    }
}

/// Queue of objects to destroy once the device is idle.
pub struct RecycleBin {
    device: Arc<DeviceContext>,
    resources: Vec<RecycledResource>,
}

impl RecycleBin {
    /// Create an empty bin with room for `capacity` entries.
    pub fn new(device: Arc<DeviceContext>, capacity: usize) -> Self {
        Self {
            device,
            resources: Vec::with_capacity(capacity),
        }
    }

    /// Take ownership of `resource` until the next [`clear`](Self::clear).
    pub fn collect(&mut self, resource: RecycledResource) {
        self.resources.push(resource);
    }

    /// Destroy everything collected so far.
    ///
    /// The device must be idle. Every entry is destroyed exactly once even if
    /// some destructions fail; the first failure is returned.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn clear(&mut self) -> Result<()> {
        if self.resources.is_empty() {
            return Ok(());
        }

        let count = self.resources.len();
        let mut first_error = None;
        for resource in self.resources.drain(..) {
            let kind = resource.kind();
            if let Err(e) = resource.destroy(&self.device) {
                tracing::warn!("failed to destroy recycled {kind}: {e}");
                first_error.get_or_insert(e);
            }
        }
        tracing::trace!(count, "recycle bin cleared");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of entries waiting for [`clear`](Self::clear).
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether nothing waits for destruction.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl Drop for RecycleBin {
    fn drop(&mut self) {
        if !self.resources.is_empty() {
            tracing::warn!(
                "Recycle bin dropped with {} pending resources.",
                self.resources.len()
            );
        }
    }
}
