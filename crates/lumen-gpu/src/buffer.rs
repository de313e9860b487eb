//! Owning buffer handle.

use crate::allocator::{Allocator, BufferInfo};
use crate::error::{GpuError, Result};
use crate::raw::MappedPtr;
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;

/// One allocation together with the allocator that produced it.
///
/// Dropping the handle frees the allocation unless the allocator no longer
/// owns it.
pub struct Buffer {
    info: BufferInfo,
    allocator: Arc<Allocator>,
}

impl Buffer {
    /// Allocate at least `size` bytes for `usage`.
    pub fn new(allocator: &Arc<Allocator>, size: u64, usage: vk::BufferUsageFlags) -> Result<Self> {
        let info = allocator.allocate(size, usage)?;
        Ok(Self {
            info,
            allocator: Arc::clone(allocator),
        })
    }

    pub fn info(&self) -> &BufferInfo {
        &self.info
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Native buffer to bind on the GPU.
    pub fn handle(&self) -> vk::Buffer {
        self.info.buffer
    }

    /// Size in bytes, after alignment.
    pub fn size(&self) -> u64 {
        self.info.size
    }

    /// Whether host writes are still possible.
    pub fn is_mapped(&self) -> bool {
        self.info.ptr.is_some()
    }

    pub(crate) fn mapped_ptr(&self) -> Result<MappedPtr> {
        self.info.ptr.ok_or(GpuError::StagingReleased)
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.info.size {
            return Err(GpuError::InvalidState(format!(
                "Range {offset}..{end} too large for buffer of {} bytes",
                self.info.size
            )));
        }
        Ok(())
    }

    /// Write raw bytes at `offset` into host memory. Call
    /// [`invalidate`](Self::invalidate) to make them visible to the GPU.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self.mapped_ptr()?;
        self.check_range(offset, data.len() as u64)?;

        // SAFETY: the range was checked against the mapping, and `&mut self`
        // excludes other host access through this handle.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len()) };
        Ok(())
    }

    /// Write typed data at `offset` into host memory.
    pub fn write<T: Pod>(&mut self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Read `len` bytes at `offset` back from host memory.
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let ptr = self.mapped_ptr()?;
        self.check_range(offset, len)?;

        let mut out = vec![0u8; len as usize];
        // SAFETY: the range was checked against the mapping.
        unsafe { std::ptr::copy_nonoverlapping(ptr.add(offset), out.as_mut_ptr(), out.len()) };
        Ok(out)
    }

    /// Make host writes to `[offset, offset + size)` visible to the GPU.
    pub fn invalidate(&self, offset: u64, size: u64) -> Result<()> {
        self.allocator.invalidate(&self.info, offset, size)
    }

    /// Invalidate the whole buffer.
    pub fn invalidate_all(&self) -> Result<()> {
        self.invalidate(0, self.info.size)
    }

    /// Release the staging half of a device allocation.
    ///
    /// The handle keeps the device-local buffer; host writes and
    /// invalidations fail from now on.
    pub fn free_host(&mut self) -> Result<()> {
        // SAFETY: views hold their buffer by value and never hand out
        // `&mut Buffer`, so `&mut self` means no view maps this allocation;
        // the cleared pointer below is the only other copy.
        let result = unsafe { self.allocator.free_host(&self.info) };
        if let Some(device) = self.allocator.as_device() {
            if !device.has_staging(&self.info) {
                self.info.ptr = None;
            }
        }
        result
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("buffer", &self.info.buffer)
            .field("size", &self.info.size)
            .field("mapped", &self.info.ptr.is_some())
            .field("allocator", &self.allocator.kind())
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // SAFETY: the handle and any view wrapping it are going away.
        if let Err(e) = unsafe { self.allocator.release(&self.info) } {
            tracing::error!(buffer = ?self.info.buffer, "failed to free buffer: {e}");
        }
    }
}
