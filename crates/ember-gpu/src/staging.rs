//! Staging buffer pool, based on multiple fixed-size host-visible chunks.

use crate::device::{AllocationId, BufferDesc, DeviceContext, MappedPtr};
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// A range of staging memory handed out by [`StagingBufferPool::alloc`].
#[derive(Debug, Clone, Copy)]
pub struct StagingRegion {
    /// Backing chunk buffer.
    pub buffer: vk::Buffer,
    /// Byte offset of the region inside `buffer`.
    pub offset: u64,
    /// Size of the region in bytes.
    pub size: u64,
    /// Index of the chunk the region lives in.
    pub chunk: usize,
    /// Host pointer to the start of the region.
    pub mapped: MappedPtr,
}

impl StagingRegion {
    /// Copy `data` into the region.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.write_at(0, data)
    }

    /// Copy `data` into the region starting `offset` bytes in.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(
                "Data range too large for staging region".to_string(),
            ));
        }

        // SAFETY: the range was bounds-checked against the region, which lies
        // inside a live mapped chunk.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapped.add(offset as usize).as_ptr(),
                data.len(),
            );
        }
        Ok(())
    }
}

struct StagingChunk {
    buffer: vk::Buffer,
    allocation: AllocationId,
    mapped: MappedPtr,
    capacity: u64,
    cursor: u64,
}

/// Staging buffer pool.
///
/// Allocations never span chunks. Cursors are rewound once per frame by
/// [`reset`](Self::reset); the chunks themselves are kept for reuse.
pub struct StagingBufferPool {
    device: Arc<DeviceContext>,
    chunk_size: u64,
    chunks: Vec<StagingChunk>,
}

impl StagingBufferPool {
    /// Create an empty pool with chunks of `chunk_size` bytes.
    pub fn new(device: Arc<DeviceContext>, chunk_size: u64) -> Self {
        Self {
            device,
            chunk_size: chunk_size.max(1),
            chunks: Vec::new(),
        }
    }

    /// Reserve `size` bytes aligned to `alignment`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Result<StagingRegion> {
        let alignment = alignment.max(1);

        let fit = self.chunks.iter().enumerate().find_map(|(index, chunk)| {
            let offset = chunk.cursor.next_multiple_of(alignment);
            (offset <= chunk.capacity && chunk.capacity - offset >= size)
                .then_some((index, offset))
        });

        let (index, offset) = match fit {
            Some(fit) => fit,
            None => (self.create_chunk(size)?, 0),
        };

        let chunk = &mut self.chunks[index];
        chunk.cursor = offset + size;

        Ok(StagingRegion {
            buffer: chunk.buffer,
            offset,
            size,
            chunk: index,
            // SAFETY: offset + size <= capacity of the mapped chunk
            mapped: unsafe { chunk.mapped.add(offset as usize) },
        })
    }

    fn create_chunk(&mut self, min_size: u64) -> Result<usize> {
        let capacity = self.chunk_size.max(min_size);
        let allocation = self.device.raw().create_buffer(&BufferDesc {
            size: capacity,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
            name: "staging_chunk",
        })?;

        let Some(mapped) = allocation.mapped else {
            // Unusable without a host mapping; release it again.
            self.device
                .raw()
                .destroy_buffer(allocation.buffer, allocation.allocation)?;
            return Err(GpuError::AllocationFailed(
                "staging chunk is not host visible".to_string(),
            ));
        };

        self.chunks.push(StagingChunk {
            buffer: allocation.buffer,
            allocation: allocation.allocation,
            mapped,
            capacity,
            cursor: 0,
        });
        tracing::debug!(
            chunks = self.chunks.len(),
            capacity,
            "staging pool grew"
        );

        Ok(self.chunks.len() - 1)
    }

    /// Rewind every chunk. Only call once the device consumed all staged data.
    pub fn reset(&mut self) {
        for chunk in &mut self.chunks {
            chunk.cursor = 0;
        }
    }

    /// Number of chunks created so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes handed out since the last reset, alignment padding included.
    pub fn bytes_in_use(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.cursor).sum()
    }
}

impl Drop for StagingBufferPool {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            if let Err(e) = self
                .device
                .raw()
                .destroy_buffer(chunk.buffer, chunk.allocation)
            {
                tracing::warn!("failed to free staging chunk: {e}");
            }
        }
    }
}
