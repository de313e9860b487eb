//! Allocator backed by host-visible memory.

use crate::allocator::{check_range, checked_align_size, unknown_allocation, BufferInfo, NativeBuffer};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct HostAllocation {
    size: u64,
    native: NativeBuffer,
}

/// Allocates one mapped, host-visible buffer per allocation.
///
/// The memory may be non-coherent, so [`invalidate`](Self::invalidate) always
/// flushes the written range.
pub struct HostAllocator {
    context: Arc<GpuContext>,
    alignment: u64,
    allocations: Mutex<HashMap<vk::Buffer, HostAllocation>>,
}

impl HostAllocator {
    pub fn new(context: Arc<GpuContext>, alignment: u64) -> Self {
        Self {
            context,
            alignment,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn allocate(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<BufferInfo> {
        if size == 0 {
            return Err(GpuError::ZeroSizedAllocation);
        }
        let size = checked_align_size(size, self.alignment)?;

        let (native, ptr) =
            NativeBuffer::create_mapped(self.context.raw().as_ref(), size, usage, "host_buffer")?;
        let info = BufferInfo {
            size,
            buffer: native.buffer,
            ptr: Some(ptr),
        };

        self.allocations
            .lock()
            .insert(native.buffer, HostAllocation { size, native });
        tracing::debug!(buffer = ?info.buffer, size, ?usage, "host allocation");
        Ok(info)
    }

    /// Unmap and destroy `info`.
    ///
    /// # Safety
    /// `info.ptr` must not be accessed afterwards.
    pub unsafe fn free(&self, info: &BufferInfo) -> Result<()> {
        let allocation = self
            .allocations
            .lock()
            .remove(&info.buffer)
            .unwrap_or_else(|| unknown_allocation(info.buffer));
        self.destroy(allocation)
    }

    /// # Safety
    /// As for [`free`](Self::free).
    pub unsafe fn release(&self, info: &BufferInfo) -> Result<bool> {
        let allocation = self.allocations.lock().remove(&info.buffer);
        match allocation {
            Some(allocation) => self.destroy(allocation).map(|()| true),
            None => Ok(false),
        }
    }

    /// Flush `[offset, offset + size)` of the mapping to the device.
    pub fn invalidate(&self, info: &BufferInfo, offset: u64, size: u64) -> Result<()> {
        check_range(info, offset, size);
        let allocations = self.allocations.lock();
        let allocation = allocations
            .get(&info.buffer)
            .unwrap_or_else(|| unknown_allocation(info.buffer));
        if size == 0 {
            return Ok(());
        }

        tracing::trace!(buffer = ?info.buffer, offset, size, "flush host allocation");
        // SAFETY: the table lock keeps the memory alive; flushing does not wait on the GPU.
        unsafe {
            self.context
                .raw()
                .flush_memory(&allocation.native.memory, offset, size)
        }
    }

    pub fn own(&self, info: &BufferInfo) -> bool {
        self.allocations.lock().contains_key(&info.buffer)
    }

    /// Sum of the sizes of live allocations.
    pub fn size(&self) -> u64 {
        self.allocations.lock().values().map(|a| a.size).sum()
    }

    fn destroy(&self, allocation: HostAllocation) -> Result<()> {
        tracing::debug!(buffer = ?allocation.native.buffer, size = allocation.size, "free host allocation");
        allocation.native.destroy(self.context.raw().as_ref())
    }
}

impl Drop for HostAllocator {
    fn drop(&mut self) {
        for (buffer, allocation) in self.allocations.get_mut().drain() {
            tracing::warn!(?buffer, "host allocation leaked until allocator drop");
            if let Err(e) = allocation.native.destroy(self.context.raw().as_ref()) {
                tracing::error!(?buffer, "failed to free host allocation: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{test_context, FlushRecord, HeadlessConfig};

    #[test]
    fn invalidate_flushes_the_range() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = HostAllocator::new(context, 16);
        let info = allocator
            .allocate(40, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(info.size, 48);
        assert!(info.ptr.is_some());

        allocator.invalidate(&info, 16, 8).unwrap();
        allocator.invalidate(&info, 48, 0).unwrap();
        allocator.invalidate(&info, 0, 0).unwrap();
        let flushes = device.flushes();
        assert_eq!(flushes.len(), 1);
        assert_eq!(
            flushes[0],
            FlushRecord {
                memory: flushes[0].memory,
                offset: 16,
                size: 8,
            }
        );
        unsafe { allocator.free(&info) }.unwrap();
    }

    #[test]
    fn size_sums_live_allocations() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = HostAllocator::new(context, 256);
        let a = allocator
            .allocate(10, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();
        let b = allocator
            .allocate(300, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();
        assert_eq!(allocator.size(), 256 + 512);
        assert_eq!(device.stats().allocated_bytes, 256 + 512);

        unsafe { allocator.free(&a) }.unwrap();
        assert_eq!(allocator.size(), 512);
        unsafe { allocator.free(&b) }.unwrap();
        assert_eq!(allocator.size(), 0);
        assert_eq!(device.stats().buffers, 0);
        assert_eq!(device.stats().memory_objects, 0);
    }

    #[test]
    fn allocation_failure_leaves_no_residue() {
        let (device, context) = test_context(HeadlessConfig {
            memory_budget: Some(1000),
            ..HeadlessConfig::default()
        });
        let allocator = HostAllocator::new(context, 0);
        let err = allocator
            .allocate(2000, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
        assert_eq!(allocator.size(), 0);
        assert_eq!(device.stats().buffers, 0);
    }

    #[test]
    fn concurrent_allocate_and_free() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = HostAllocator::new(context, 64);

        std::thread::scope(|s| {
            for t in 0..8u64 {
                let allocator = &allocator;
                s.spawn(move || {
                    let infos: Vec<BufferInfo> = (1..=16)
                        .map(|i| {
                            allocator
                                .allocate(i * (t + 1), vk::BufferUsageFlags::STORAGE_BUFFER)
                                .unwrap()
                        })
                        .collect();
                    for info in &infos {
                        assert!(allocator.own(info));
                        allocator.invalidate(info, 0, info.size).unwrap();
                    }
                    for info in &infos {
                        unsafe { allocator.free(info) }.unwrap();
                    }
                });
            }
        });

        assert_eq!(allocator.size(), 0);
        assert_eq!(device.stats().buffers, 0);
        assert_eq!(device.flushes().len(), 8 * 16);
    }
}
