//! Allocator pairing host-visible staging memory with device-local memory.
//!
//! Every allocation owns a staging buffer, a device-local buffer of the same
//! size, a transfer command buffer and a fence. [`DeviceAllocator::invalidate`]
//! copies a byte range from staging to device and blocks until the copy has
//! completed, so callers should batch their writes before invalidating.
//!
//! The allocation table lock is only taken to look up, insert or remove
//! entries. Each allocation has its own lock around the command buffer and
//! fence, which serializes concurrent invalidations of the same allocation
//! without blocking work on other allocations.
//!
//! An upload whose fence wait fails leaves the allocation pending: the copy
//! may still be running, so later uploads fail with
//! [`GpuError::UploadPending`] until the fence signals, and releasing the
//! allocation first waits for the copy to finish.

use crate::allocator::{check_range, checked_align_size, unknown_allocation, BufferInfo, NativeBuffer};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::raw::{MappedPtr, Submission};
use crate::sync::Fence;
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Host side of an allocation and the objects used to upload from it.
struct Staging {
    native: NativeBuffer,
    command_buffer: vk::CommandBuffer,
    fence: Fence,
}

struct Halves {
    staging: Option<Staging>,
    device: Option<NativeBuffer>,
    /// Set when the last upload was submitted but not seen to complete.
    pending: bool,
}

struct DeviceAllocation {
    size: u64,
    host_size: AtomicU64,
    halves: Mutex<Halves>,
}

/// Allocates staging/device buffer pairs and keeps them in sync by explicit copies.
pub struct DeviceAllocator {
    context: Arc<GpuContext>,
    alignment: u64,
    timeout: Option<Duration>,
    allocations: Mutex<HashMap<vk::Buffer, Arc<DeviceAllocation>>>,
}

impl DeviceAllocator {
    pub fn new(context: Arc<GpuContext>, alignment: u64) -> Self {
        Self {
            context,
            alignment,
            timeout: None,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Bound the fence wait of each upload. Without it, uploads wait forever.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Allocate a staging and a device-local buffer of `align_size(size)` bytes.
    ///
    /// The returned info identifies the device-local buffer and maps the staging buffer.
    pub fn allocate(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<BufferInfo> {
        if size == 0 {
            return Err(GpuError::ZeroSizedAllocation);
        }
        let size = checked_align_size(size, self.alignment)?;

        let fence = Fence::new(self.context.raw(), false)?;
        let pool = self.context.transfer_pool();
        let command_buffer = pool
            .allocate_command_buffers(vk::CommandBufferLevel::PRIMARY, 1)?
            .pop()
            .ok_or_else(|| GpuError::InvalidState("no command buffer allocated".to_string()))?;

        let (staging, ptr, device) = match self.create_buffers(size, usage) {
            Ok(buffers) => buffers,
            Err(e) => {
                pool.free_command_buffers(&[command_buffer]);
                return Err(e);
            }
        };

        let info = BufferInfo {
            size,
            buffer: device.buffer,
            ptr: Some(ptr),
        };
        let allocation = DeviceAllocation {
            size,
            host_size: AtomicU64::new(size),
            halves: Mutex::new(Halves {
                staging: Some(Staging {
                    native: staging,
                    command_buffer,
                    fence,
                }),
                device: Some(device),
                pending: false,
            }),
        };

        self.allocations
            .lock()
            .insert(info.buffer, Arc::new(allocation));
        tracing::debug!(buffer = ?info.buffer, size, ?usage, "device allocation");
        Ok(info)
    }

    fn create_buffers(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<(NativeBuffer, MappedPtr, NativeBuffer)> {
        let raw = self.context.raw().as_ref();
        let (staging, ptr) = NativeBuffer::create_mapped(
            raw,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_SRC,
            "staging_buffer",
        )?;

        match NativeBuffer::create(
            raw,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            "device_buffer",
        ) {
            Ok(device) => Ok((staging, ptr, device)),
            Err(e) => {
                if let Err(cleanup) = staging.destroy(raw) {
                    tracing::error!("failed to release staging buffer after error: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Release both halves of `info`.
    ///
    /// # Safety
    /// `info.ptr` must not be accessed afterwards.
    pub unsafe fn free(&self, info: &BufferInfo) -> Result<()> {
        let allocation = self
            .allocations
            .lock()
            .remove(&info.buffer)
            .unwrap_or_else(|| unknown_allocation(info.buffer));
        self.destroy(info.buffer, &allocation)
    }

    /// # Safety
    /// As for [`free`](Self::free).
    pub unsafe fn release(&self, info: &BufferInfo) -> Result<bool> {
        let allocation = self.allocations.lock().remove(&info.buffer);
        match allocation {
            Some(allocation) => self.destroy(info.buffer, &allocation).map(|()| true),
            None => Ok(false),
        }
    }

    /// Release the staging half of `info`, keeping the device-local buffer.
    ///
    /// Later invalidations of the allocation fail with
    /// [`GpuError::StagingReleased`]. Releasing twice is a no-op.
    ///
    /// # Safety
    /// `info.ptr` must not be accessed afterwards.
    pub unsafe fn free_host(&self, info: &BufferInfo) -> Result<()> {
        let allocation = self.lookup(info.buffer);
        let staging = {
            let mut halves = allocation.halves.lock();
            Self::settle(info.buffer, &mut halves)?;
            halves.staging.take()
        };
        let Some(staging) = staging else {
            return Ok(());
        };

        allocation.host_size.store(0, Ordering::Release);
        tracing::debug!(buffer = ?info.buffer, "free staging half");
        self.destroy_staging(staging)
    }

    /// Copy `[offset, offset + size)` from staging to device memory and wait for it.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn invalidate(&self, info: &BufferInfo, offset: u64, size: u64) -> Result<()> {
        check_range(info, offset, size);
        let allocation = self.lookup(info.buffer);
        if size == 0 {
            return Ok(());
        }

        let mut guard = allocation.halves.lock();
        let halves = &mut *guard;
        let (Some(staging), Some(device)) = (&halves.staging, &halves.device) else {
            return Err(GpuError::StagingReleased);
        };
        if halves.pending {
            if !staging.fence.is_signaled()? {
                return Err(GpuError::UploadPending);
            }
            halves.pending = false;
        }

        let raw = self.context.raw();
        // SAFETY: the staging memory is alive while the allocation lock is held.
        unsafe { raw.flush_memory(&staging.native.memory, offset, size)? };

        let region = vk::BufferCopy {
            src_offset: offset,
            dst_offset: offset,
            size,
        };
        self.context.transfer_pool().record(
            staging.command_buffer,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            |raw, cmd| {
                // SAFETY: both buffers are alive and the region was range-checked.
                unsafe { raw.cmd_copy_buffer(cmd, staging.native.buffer, device.buffer, &[region]) };
            },
        )?;

        staging.fence.reset()?;
        self.context.queues().submit(
            vk::QueueFlags::TRANSFER,
            &[Submission::commands(vec![staging.command_buffer])],
            Some(&staging.fence),
        )?;
        if let Err(e) = staging.fence.wait(self.timeout) {
            halves.pending = true;
            return Err(e);
        }

        tracing::trace!(buffer = ?info.buffer, offset, size, "uploaded range");
        Ok(())
    }

    pub fn own(&self, info: &BufferInfo) -> bool {
        self.allocations.lock().contains_key(&info.buffer)
    }

    /// Bytes held on both sides.
    pub fn size(&self) -> u64 {
        self.allocations
            .lock()
            .values()
            .map(|a| a.size + a.host_size.load(Ordering::Acquire))
            .sum()
    }

    /// Bytes of staging memory still held.
    pub fn size_on_host(&self) -> u64 {
        self.allocations
            .lock()
            .values()
            .map(|a| a.host_size.load(Ordering::Acquire))
            .sum()
    }

    /// Bytes of device-local memory held.
    pub fn size_on_device(&self) -> u64 {
        self.allocations.lock().values().map(|a| a.size).sum()
    }

    fn lookup(&self, buffer: vk::Buffer) -> Arc<DeviceAllocation> {
        self.allocations
            .lock()
            .get(&buffer)
            .cloned()
            .unwrap_or_else(|| unknown_allocation(buffer))
    }

    /// Whether `info` still has its staging half.
    pub(crate) fn has_staging(&self, info: &BufferInfo) -> bool {
        let allocation = self.allocations.lock().get(&info.buffer).cloned();
        allocation.is_some_and(|a| a.halves.lock().staging.is_some())
    }

    /// Wait out an upload that was left pending, so its buffers can be destroyed.
    ///
    /// A lost device no longer executes anything, so the wait failing with
    /// [`GpuError::DeviceLost`] also settles the allocation.
    fn settle(buffer: vk::Buffer, halves: &mut Halves) -> Result<()> {
        if !halves.pending {
            return Ok(());
        }
        if let Some(staging) = &halves.staging {
            tracing::debug!(?buffer, "waiting for pending upload");
            match staging.fence.wait(None) {
                Ok(()) | Err(GpuError::DeviceLost) => {}
                Err(e) => return Err(e),
            }
        }
        halves.pending = false;
        Ok(())
    }

    fn destroy(&self, buffer: vk::Buffer, allocation: &DeviceAllocation) -> Result<()> {
        let (staging, device) = {
            let mut halves = allocation.halves.lock();
            if let Err(e) = Self::settle(buffer, &mut halves) {
                // The copy may still be running, so the buffers are leaked
                // rather than destroyed under it.
                tracing::error!(?buffer, "leaking device allocation with an unfinished upload: {e}");
                std::mem::forget(halves.staging.take());
                std::mem::forget(halves.device.take());
                allocation.host_size.store(0, Ordering::Release);
                return Err(e);
            }
            (halves.staging.take(), halves.device.take())
        };
        allocation.host_size.store(0, Ordering::Release);
        tracing::debug!(?buffer, size = allocation.size, "free device allocation");

        let staging_result = staging.map_or(Ok(()), |s| self.destroy_staging(s));
        let device_result = device.map_or(Ok(()), |d| d.destroy(self.context.raw().as_ref()));
        staging_result.and(device_result)
    }

    fn destroy_staging(&self, staging: Staging) -> Result<()> {
        self.context
            .transfer_pool()
            .free_command_buffers(&[staging.command_buffer]);
        drop(staging.fence);
        staging.native.destroy(self.context.raw().as_ref())
    }
}

impl Drop for DeviceAllocator {
    fn drop(&mut self) {
        let allocations: Vec<_> = self.allocations.get_mut().drain().collect();
        for (buffer, allocation) in allocations {
            tracing::warn!(?buffer, "device allocation leaked until allocator drop");
            if let Err(e) = self.destroy(buffer, &allocation) {
                tracing::error!(?buffer, "failed to free device allocation: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{test_context, HeadlessConfig};

    fn write(info: &BufferInfo, offset: u64, bytes: &[u8]) {
        let ptr = info.ptr.unwrap();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len()) };
    }

    #[test]
    fn size_is_split_between_host_and_device() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = DeviceAllocator::new(context, 256);
        let info = allocator
            .allocate(100, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();

        assert_eq!(allocator.size(), allocator.size_on_host() + allocator.size_on_device());
        assert_eq!(allocator.size_on_host() + allocator.size_on_device(), 2 * 256);

        unsafe { allocator.free_host(&info) }.unwrap();
        assert_eq!(allocator.size_on_host(), 0);
        assert_eq!(allocator.size(), allocator.size_on_device());
        assert_eq!(allocator.size(), 256);

        unsafe { allocator.free(&info) }.unwrap();
        assert_eq!(allocator.size(), 0);
    }

    #[test]
    fn invalidate_copies_range_to_device() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = DeviceAllocator::new(context, 0);
        let info = allocator
            .allocate(8, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();

        write(&info, 0, &[9, 9, 9, 9, 5, 6, 7, 8]);
        allocator.invalidate(&info, 4, 4).unwrap();
        assert_eq!(device.read_buffer(info.buffer).unwrap(), vec![0, 0, 0, 0, 5, 6, 7, 8]);

        allocator.invalidate(&info, 0, 8).unwrap();
        assert_eq!(device.read_buffer(info.buffer).unwrap(), vec![9, 9, 9, 9, 5, 6, 7, 8]);

        let submissions = device.submissions();
        assert_eq!(submissions.len(), 2);
        assert_ne!(submissions[0].queue, submissions[1].queue);
        assert_eq!(device.flushes().len(), 2);
        unsafe { allocator.free(&info) }.unwrap();
    }

    #[test]
    fn invalidate_after_free_host_fails() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = DeviceAllocator::new(context, 0);
        let info = allocator
            .allocate(4, vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();
        write(&info, 0, &[1, 2, 3, 4]);
        allocator.invalidate(&info, 0, 4).unwrap();

        unsafe { allocator.free_host(&info) }.unwrap();
        unsafe { allocator.free_host(&info) }.unwrap();
        assert!(allocator.own(&info));
        assert!(matches!(
            allocator.invalidate(&info, 0, 4),
            Err(GpuError::StagingReleased)
        ));

        // Device contents survive the staging release.
        assert_eq!(device.read_buffer(info.buffer).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(device.stats().buffers, 1);
        assert_eq!(device.stats().fences, 0);

        unsafe { allocator.free(&info) }.unwrap();
        assert_eq!(device.stats().buffers, 0);
        assert_eq!(device.stats().command_buffers, 0);
    }

    #[test]
    fn lost_device_fails_invalidate() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = DeviceAllocator::new(context, 0).with_timeout(Duration::from_millis(10));
        let info = allocator
            .allocate(4, vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();
        device.lose_device();
        assert!(matches!(
            allocator.invalidate(&info, 0, 4),
            Err(GpuError::DeviceLost | GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
        unsafe { allocator.free(&info) }.unwrap();
    }

    #[test]
    fn timed_out_upload_blocks_until_complete() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = DeviceAllocator::new(context, 0).with_timeout(Duration::from_millis(1));
        let info = allocator
            .allocate(4, vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();
        write(&info, 0, &[1, 2, 3, 4]);

        device.stall_queues();
        assert!(matches!(
            allocator.invalidate(&info, 0, 4),
            Err(GpuError::FenceTimeout)
        ));
        let submitted = device.submissions().len();
        assert!(matches!(
            allocator.invalidate(&info, 0, 4),
            Err(GpuError::UploadPending)
        ));
        assert_eq!(device.submissions().len(), submitted);

        // The staging half cannot be released under the running copy.
        assert!(unsafe { allocator.free_host(&info) }.is_err());
        assert_eq!(allocator.size_on_host(), 4);

        device.resume_queues();
        assert_eq!(device.read_buffer(info.buffer).unwrap(), vec![1, 2, 3, 4]);
        allocator.invalidate(&info, 0, 4).unwrap();
        assert_eq!(device.submissions().len(), submitted + 1);

        unsafe { allocator.free(&info) }.unwrap();
        assert_eq!(device.stats().buffers, 0);
    }

    #[test]
    fn pending_upload_is_waited_for_before_free() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = DeviceAllocator::new(context, 0).with_timeout(Duration::from_millis(1));
        let info = allocator
            .allocate(8, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();

        device.stall_queues();
        assert!(allocator.invalidate(&info, 0, 8).is_err());

        // Still running: the buffers are left alive.
        assert!(unsafe { allocator.free(&info) }.is_err());
        assert!(!allocator.own(&info));
        assert_eq!(device.stats().buffers, 2);

        let other = allocator
            .allocate(8, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();
        assert!(allocator.invalidate(&other, 0, 8).is_err());
        device.resume_queues();
        unsafe { allocator.free(&other) }.unwrap();
        assert_eq!(device.stats().buffers, 2);
    }

    #[test]
    fn size_is_consistent_under_concurrent_churn() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = DeviceAllocator::new(context, 16);
        let kept = allocator
            .allocate(16, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..64 {
                    let info = allocator
                        .allocate(16, vk::BufferUsageFlags::STORAGE_BUFFER)
                        .unwrap();
                    unsafe { allocator.free(&info) }.unwrap();
                }
            });
            for _ in 0..64 {
                let size = allocator.size();
                assert!(size == 32 || size == 64, "size {size} never existed");
            }
        });
        unsafe { allocator.free(&kept) }.unwrap();
    }

    #[test]
    fn failed_device_half_releases_staging() {
        let (device, context) = test_context(HeadlessConfig {
            memory_budget: Some(1500),
            ..HeadlessConfig::default()
        });
        let allocator = DeviceAllocator::new(context, 0);
        assert!(allocator
            .allocate(1000, vk::BufferUsageFlags::STORAGE_BUFFER)
            .is_err());

        let stats = device.stats();
        assert_eq!(stats.buffers, 0);
        assert_eq!(stats.memory_objects, 0);
        assert_eq!(stats.command_buffers, 0);
        assert_eq!(stats.fences, 0);
        assert_eq!(allocator.size(), 0);
    }

    #[test]
    #[should_panic(expected = "exceeds allocation")]
    fn invalidate_out_of_range_panics() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = DeviceAllocator::new(context, 0);
        let info = allocator
            .allocate(4, vk::BufferUsageFlags::VERTEX_BUFFER)
            .unwrap();
        let _ = allocator.invalidate(&info, 2, 4);
    }

    #[test]
    fn concurrent_uploads_to_distinct_and_shared_allocations() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = DeviceAllocator::new(context, 4);
        let shared = allocator
            .allocate(4 * 8, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();

        std::thread::scope(|s| {
            for t in 0..8u8 {
                let allocator = &allocator;
                let shared = &shared;
                s.spawn(move || {
                    let own = allocator
                        .allocate(16, vk::BufferUsageFlags::STORAGE_BUFFER)
                        .unwrap();
                    write(&own, 0, &[t; 16]);
                    allocator.invalidate(&own, 0, 16).unwrap();

                    write(shared, u64::from(t) * 4, &[t; 4]);
                    allocator.invalidate(shared, u64::from(t) * 4, 4).unwrap();

                    unsafe { allocator.free(&own) }.unwrap();
                });
            }
        });

        let contents = device.read_buffer(shared.buffer).unwrap();
        for t in 0..8u8 {
            assert_eq!(&contents[usize::from(t) * 4..usize::from(t) * 4 + 4], &[t; 4]);
        }
        unsafe { allocator.free(&shared) }.unwrap();
        assert_eq!(device.stats().buffers, 0);
    }
}
