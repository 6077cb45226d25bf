//! Per-frame upload workload.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use ember_gpu::{
    BufferAllocation, BufferDesc, BufferViewSource, ContextId, DescriptorSetLayoutBuilder,
    GpuContext, GpuResources, RawDevice, RecycledResource, SharedDescriptorSet,
};
use gpu_allocator::MemoryLocation;
use std::time::Instant;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameUniforms {
    frame: u32,
    slot: u32,
    seconds: f32,
    _pad: u32,
}

const UNIFORM_SIZE: u64 = std::mem::size_of::<FrameUniforms>() as u64;
const UNIFORM_BUFFER_ID: u64 = 1;
const HOST_BUFFER_ID: u64 = 2;
const WORKER: ContextId = ContextId(1);

pub struct Probe<'a> {
    gpu: &'a GpuContext,
    resources: &'a GpuResources,
    layout: vk::DescriptorSetLayout,
    set: SharedDescriptorSet,
    uniforms: Option<BufferAllocation>,
    host: BufferAllocation,
    started: Instant,
}

impl<'a> Probe<'a> {
    pub fn new(gpu: &'a GpuContext, resources: &'a GpuResources) -> anyhow::Result<Self> {
        let builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::ALL)
            .storage_buffer(1, vk::ShaderStageFlags::ALL);
        let layout = unsafe { builder.build(gpu.device())? };
        resources.link_descriptor_set_layout(layout, builder.bindings());
        let set = resources.create_descriptor_set(layout, builder.writes())?;

        // Written by the host at offset 0 and by the worker's copy after that
        let host = gpu.create_buffer(&BufferDesc {
            size: UNIFORM_SIZE * 2,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::CpuToGpu,
            name: "probe_host",
        })?;
        resources.connect_descriptor(
            &BufferViewSource {
                id: HOST_BUFFER_ID,
                buffer: host.buffer,
                base_offset: 0,
                offset: 0,
                range: host.size,
            },
            &set,
            1,
        );

        Ok(Self {
            gpu,
            resources,
            layout,
            set,
            uniforms: None,
            host,
            started: Instant::now(),
        })
    }

    pub fn frame(&mut self, frame: u32) -> anyhow::Result<()> {
        let data = FrameUniforms {
            frame,
            slot: self.resources.device().back_buffer_index(),
            seconds: self.started.elapsed().as_secs_f32(),
            _pad: 0,
        };

        // A fresh device-local buffer every frame; the descriptor follows it
        let uniforms = self.gpu.create_buffer(&BufferDesc {
            size: UNIFORM_SIZE,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
            name: "probe_uniforms",
        })?;
        self.upload(ContextId::MAIN, &data, uniforms.buffer, 0)?;

        let source = BufferViewSource {
            id: UNIFORM_BUFFER_ID,
            buffer: uniforms.buffer,
            base_offset: 0,
            offset: 0,
            range: UNIFORM_SIZE,
        };
        if self.uniforms.is_none() {
            self.resources.connect_descriptor(&source, &self.set, 0);
            self.resources.record_descriptor_write(&self.set);
        } else {
            self.resources.update_descriptors(&source);
        }

        if let Some(old) = self.uniforms.replace(uniforms) {
            self.resources.recycle(RecycledResource::Buffer {
                buffer: old.buffer,
                allocation: old.allocation,
            });
        }

        if let Some(mapped) = self.host.mapped {
            // SAFETY: the host buffer is alive and at least UNIFORM_SIZE bytes
            unsafe {
                self.resources
                    .transport_copy(ContextId::MAIN, mapped, bytemuck::bytes_of(&data))?;
            }
        }

        // Second recording context with its own command and staging pools
        let host_buffer = self.host.buffer;
        std::thread::scope(|scope| {
            scope
                .spawn(|| self.upload(WORKER, &data, host_buffer, UNIFORM_SIZE))
                .join()
        })
        .map_err(|_| anyhow::anyhow!("upload worker panicked"))??;

        Ok(())
    }

    fn upload(
        &self,
        context: ContextId,
        data: &FrameUniforms,
        dst: vk::Buffer,
        dst_offset: u64,
    ) -> anyhow::Result<()> {
        let alignment = self
            .gpu
            .capabilities()
            .optimal_buffer_copy_offset_alignment;
        let region = self
            .resources
            .alloc_staging_region(context, UNIFORM_SIZE, alignment)?;
        region.write(bytemuck::bytes_of(data))?;

        let device = self.gpu.device();
        self.resources.transport_check_in(
            context,
            |cmd| unsafe {
                device.cmd_copy_buffer(
                    cmd,
                    region.buffer,
                    dst,
                    &[vk::BufferCopy {
                        src_offset: region.offset,
                        dst_offset,
                        size: UNIFORM_SIZE,
                    }],
                );
            },
            false,
        )?;
        Ok(())
    }

    /// Release everything the probe created.
    pub fn finish(self) -> anyhow::Result<()> {
        self.resources.retire_descriptor_set(&self.set);
        if let Some(uniforms) = self.uniforms {
            self.resources.recycle(RecycledResource::Buffer {
                buffer: uniforms.buffer,
                allocation: uniforms.allocation,
            });
        }
        self.resources.recycle(RecycledResource::Buffer {
            buffer: self.host.buffer,
            allocation: self.host.allocation,
        });
        self.resources.retire_descriptor_set_layout(self.layout);
        self.resources.drain_recycle_bin()?;
        Ok(())
    }
}
