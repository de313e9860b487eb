//! Upload helpers built on the allocators.

use crate::allocator::{Allocator, AllocatorKind};
use crate::buffer::Buffer;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::raw::Submission;
use crate::sync::Fence;
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

/// A reusable host-visible buffer for copying data into arbitrary GPU buffers.
///
/// Unlike a device allocation, the destination is chosen per copy, so one
/// staging buffer can feed many device-only buffers. Copies are always waited
/// for without a timeout: the destination is only borrowed for the call and
/// must not be freed under a running copy.
pub struct StagingBuffer {
    context: Arc<GpuContext>,
    buffer: Buffer,
    command_buffer: vk::CommandBuffer,
    fence: Fence,
}

impl StagingBuffer {
    /// Create a staging buffer of at least `size` bytes.
    pub fn new(context: &Arc<GpuContext>, size: u64) -> Result<Self> {
        let allocator = Allocator::host(context, 0);
        let buffer = Buffer::new(&allocator, size, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let fence = Fence::new(context.raw(), false)?;
        let command_buffer = context
            .transfer_pool()
            .allocate_command_buffers(vk::CommandBufferLevel::PRIMARY, 1)?
            .pop()
            .ok_or_else(|| GpuError::InvalidState("no command buffer allocated".to_string()))?;

        Ok(Self {
            context: Arc::clone(context),
            buffer,
            command_buffer,
            fence,
        })
    }

    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Copy `data` into the staging buffer at `offset` and flush it.
    pub fn write<T: Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.buffer.write_bytes(offset, bytes)?;
        self.buffer.invalidate(offset, bytes.len() as u64)
    }

    /// Copy `size` bytes from `src_offset` of the staging buffer to
    /// `dst_offset` of `dst` and wait for the copy to complete.
    ///
    /// `dst` must have been created with `TRANSFER_DST` usage, which every
    /// device allocation has.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn sync(&mut self, dst: &Buffer, src_offset: u64, dst_offset: u64, size: u64) -> Result<()> {
        check_copy_range("Staging", src_offset, size, self.buffer.size())?;
        check_copy_range("Destination", dst_offset, size, dst.size())?;
        if size == 0 {
            return Ok(());
        }

        let src = self.buffer.handle();
        let dst = dst.handle();
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        self.context.transfer_pool().record(
            self.command_buffer,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            |raw, cmd| {
                // SAFETY: both ranges were checked against their buffers.
                unsafe { raw.cmd_copy_buffer(cmd, src, dst, &[region]) };
            },
        )?;

        self.fence.reset()?;
        self.context.queues().submit(
            vk::QueueFlags::TRANSFER,
            &[Submission::commands(vec![self.command_buffer])],
            Some(&self.fence),
        )?;
        self.fence.wait(None)?;

        tracing::trace!(?dst, src_offset, dst_offset, size, "staging copy");
        Ok(())
    }
}

fn check_copy_range(what: &str, offset: u64, size: u64, limit: u64) -> Result<()> {
    if offset.checked_add(size).map_or(true, |end| end > limit) {
        return Err(GpuError::InvalidState(format!(
            "{what} range {offset}..+{size} exceeds {limit} bytes"
        )));
    }
    Ok(())
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        self.context
            .transfer_pool()
            .free_command_buffers(&[self.command_buffer]);
    }
}

/// Upload `data` into a new buffer from `allocator`.
///
/// For a device allocator the staging half is released afterwards, so the
/// returned buffer is device-only. For a host allocator the buffer stays mapped.
///
/// # Arguments
/// * `allocator` - Allocator that owns the new buffer
/// * `data` - Elements to upload, tightly packed
/// * `usage` - How the GPU will use the buffer
pub fn upload<T: Pod>(
    allocator: &Arc<Allocator>,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> Result<Buffer> {
    let bytes: &[u8] = bytemuck::cast_slice(data);
    let mut buffer = Buffer::new(allocator, bytes.len() as u64, usage)?;
    buffer.write_bytes(0, bytes)?;
    buffer.invalidate(0, bytes.len() as u64)?;

    if allocator.kind() == AllocatorKind::Device {
        buffer.free_host()?;
    }
    tracing::debug!(buffer = ?buffer.handle(), bytes = bytes.len(), "uploaded");
    Ok(buffer)
}
