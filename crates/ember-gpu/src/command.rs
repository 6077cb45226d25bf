//! Command buffer management.
//!
//! One [`CommandBufferPool`] exists per recording context. Inside it a native
//! command pool is kept per (queue family, back-buffer slot), so buffers
//! recorded for a slot are only reset once that slot comes around again.

use crate::device::{DeviceContext, RawDevice};
use crate::error::Result;
use ash::vk;
use hashbrown::HashMap;
use std::sync::Arc;

/// What kind of command buffer to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferDesc {
    pub queue_family: u32,
    pub level: vk::CommandBufferLevel,
}

impl CommandBufferDesc {
    /// A primary command buffer for `queue_family`.
    pub fn primary(queue_family: u32) -> Self {
        Self {
            queue_family,
            level: vk::CommandBufferLevel::PRIMARY,
        }
    }

    /// A secondary command buffer for `queue_family`.
    pub fn secondary(queue_family: u32) -> Self {
        Self {
            queue_family,
            level: vk::CommandBufferLevel::SECONDARY,
        }
    }
}

/// A command buffer handed out by a [`CommandBufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBuffer {
    pub handle: vk::CommandBuffer,
    pub queue_family: u32,
    pub level: vk::CommandBufferLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    queue_family: u32,
    slot: u32,
}

/// Buffers of one native pool, split by level (primary, secondary).
struct SlotPool {
    pool: vk::CommandPool,
    available: [Vec<vk::CommandBuffer>; 2],
    pending_reset: [Vec<vk::CommandBuffer>; 2],
}

fn level_index(level: vk::CommandBufferLevel) -> usize {
    if level == vk::CommandBufferLevel::SECONDARY {
        1
    } else {
        0
    }
}

/// Command buffer pool that always tries to reuse previous allocations first.
///
/// Not shareable between recording contexts: the implicit reset in
/// [`request`](Self::request) must run on the context that records.
pub struct CommandBufferPool {
    device: Arc<DeviceContext>,
    pools: HashMap<PoolKey, SlotPool>,
    last_back_buffer_index: u32,
}

impl CommandBufferPool {
    /// Create an empty pool.
    pub fn new(device: Arc<DeviceContext>) -> Self {
        let last_back_buffer_index = device.back_buffer_index();
        Self {
            device,
            pools: HashMap::new(),
            last_back_buffer_index,
        }
    }

    fn key(&self, queue_family: u32) -> PoolKey {
        PoolKey {
            queue_family,
            slot: self.device.back_buffer_index(),
        }
    }

    /// Get a command buffer for the current back-buffer slot.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn request(&mut self, desc: CommandBufferDesc) -> Result<CommandBuffer> {
        let current = self.device.back_buffer_index();
        if current != self.last_back_buffer_index {
            self.reset()?;
            self.last_back_buffer_index = current;
        }

        let key = self.key(desc.queue_family);
        let raw = self.device.raw();
        let slot_pool = match self.pools.entry(key) {
            hashbrown::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            hashbrown::hash_map::Entry::Vacant(entry) => {
                let pool = raw.create_command_pool(
                    desc.queue_family,
                    vk::CommandPoolCreateFlags::TRANSIENT,
                )?;
                tracing::debug!(
                    queue_family = desc.queue_family,
                    slot = key.slot,
                    "created command pool"
                );
                entry.insert(SlotPool {
                    pool,
                    available: Default::default(),
                    pending_reset: Default::default(),
                })
            }
        };

        let handle = match slot_pool.available[level_index(desc.level)].pop() {
            Some(handle) => handle,
            None => raw
                .allocate_command_buffers(slot_pool.pool, desc.level, 1)?
                .pop()
                .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?,
        };

        Ok(CommandBuffer {
            handle,
            queue_family: desc.queue_family,
            level: desc.level,
        })
    }

    /// Hand a command buffer back.
    ///
    /// It becomes reusable only after its slot has been reset, i.e. once the
    /// back-buffer index has cycled back to the slot it was yielded in.
    pub fn yield_buffer(&mut self, buffer: CommandBuffer) {
        if buffer.handle == vk::CommandBuffer::null() {
            return;
        }

        let key = self.key(buffer.queue_family);
        match self.pools.get_mut(&key) {
            Some(slot_pool) => {
                slot_pool.pending_reset[level_index(buffer.level)].push(buffer.handle);
            }
            None => {
                debug_assert!(false, "wrong command pool to yield?");
                tracing::warn!(
                    queue_family = buffer.queue_family,
                    slot = key.slot,
                    "command buffer yielded to a pool that never handed it out"
                );
            }
        }
    }

    /// Recycle the buffers yielded in the current slot.
    ///
    /// Pending buffers become available again and the native pool is reset in
    /// bulk, but only for pools that had anything pending.
    pub fn reset(&mut self) -> Result<()> {
        let current = self.device.back_buffer_index();
        let raw = self.device.raw();

        for (key, slot_pool) in &mut self.pools {
            if key.slot != current {
                continue;
            }

            let mut needs_reset = false;
            for (available, pending) in slot_pool
                .available
                .iter_mut()
                .zip(slot_pool.pending_reset.iter_mut())
            {
                if !pending.is_empty() {
                    available.append(pending);
                    needs_reset = true;
                }
            }

            if needs_reset {
                raw.reset_command_pool(slot_pool.pool)?;
            }
        }

        Ok(())
    }

    /// Number of native command pools created so far.
    pub fn native_pool_count(&self) -> usize {
        self.pools.len()
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        for (_, slot_pool) in self.pools.drain() {
            self.device.raw().destroy_command_pool(slot_pool.pool);
        }
    }
}

/// Begin recording a command buffer.
pub fn begin_command_buffer(
    device: &dyn RawDevice,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    device.begin_command_buffer(cmd, flags)
}

/// End recording a command buffer.
pub fn end_command_buffer(device: &dyn RawDevice, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)
}
