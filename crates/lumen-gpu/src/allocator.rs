//! Buffer memory allocators.
//!
//! An [`Allocator`] is either a [`HostAllocator`] (one host-visible buffer per
//! allocation, invalidation flushes) or a [`DeviceAllocator`] (a host-visible
//! staging buffer mirrored into a device-local buffer, invalidation copies).
//! Both keep a table of live allocations keyed by native buffer handle.
//!
//! Handing an allocator a [`BufferInfo`] it does not own is a bug in the
//! caller and panics; GPU failures are returned as errors.

use crate::context::GpuContext;
use crate::device_allocator::DeviceAllocator;
use crate::error::{GpuError, Result};
use crate::host_allocator::HostAllocator;
use crate::raw::{BoundMemory, MappedPtr, RawDevice};
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Description of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Size in bytes, after alignment.
    pub size: u64,
    /// Native buffer handle; identifies the allocation inside its allocator.
    pub buffer: vk::Buffer,
    /// Host mapping, if the allocation can be written from the host.
    pub ptr: Option<MappedPtr>,
}

/// Round `size` up to a multiple of `alignment`. Zero alignment leaves it unchanged.
pub fn align_size(size: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        size
    } else {
        size.div_ceil(alignment) * alignment
    }
}

/// [`align_size`] that reports overflow instead of wrapping.
pub(crate) fn checked_align_size(size: u64, alignment: u64) -> Result<u64> {
    let aligned = if alignment == 0 {
        Some(size)
    } else {
        size.div_ceil(alignment).checked_mul(alignment)
    };
    aligned.ok_or_else(|| {
        GpuError::AllocationFailed(format!("{size} bytes aligned to {alignment} overflows"))
    })
}

/// Which implementation an [`Allocator`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    Host,
    Device,
}

/// A buffer allocator.
pub enum Allocator {
    Host(HostAllocator),
    Device(DeviceAllocator),
}

impl Allocator {
    /// Shared host allocator.
    pub fn host(context: &Arc<GpuContext>, alignment: u64) -> Arc<Self> {
        Arc::new(Self::Host(HostAllocator::new(Arc::clone(context), alignment)))
    }

    /// Shared staging/device allocator.
    pub fn device(context: &Arc<GpuContext>, alignment: u64) -> Arc<Self> {
        Arc::new(Self::Device(DeviceAllocator::new(
            Arc::clone(context),
            alignment,
        )))
    }

    pub fn kind(&self) -> AllocatorKind {
        match self {
            Self::Host(_) => AllocatorKind::Host,
            Self::Device(_) => AllocatorKind::Device,
        }
    }

    /// The device allocator, if this is one.
    pub fn as_device(&self) -> Option<&DeviceAllocator> {
        match self {
            Self::Host(_) => None,
            Self::Device(device) => Some(device),
        }
    }

    /// Allocate a buffer of at least `size` bytes usable for `usage`.
    pub fn allocate(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<BufferInfo> {
        match self {
            Self::Host(host) => host.allocate(size, usage),
            Self::Device(device) => device.allocate(size, usage),
        }
    }

    /// Release every native resource of `info`.
    ///
    /// Dropping the owning [`Buffer`](crate::Buffer) is the safe way to free
    /// an allocation.
    ///
    /// # Panics
    /// If `info` is not a live allocation of this allocator.
    ///
    /// # Safety
    /// No live `Buffer`, view or copy of `info.ptr` may access the mapping
    /// afterwards.
    pub unsafe fn free(&self, info: &BufferInfo) -> Result<()> {
        // SAFETY: forwarded to the caller.
        unsafe {
            match self {
                Self::Host(host) => host.free(info),
                Self::Device(device) => device.free(info),
            }
        }
    }

    /// Free `info` if this allocator still owns it. Returns whether it did.
    ///
    /// # Safety
    /// As for [`free`](Self::free).
    pub unsafe fn release(&self, info: &BufferInfo) -> Result<bool> {
        // SAFETY: forwarded to the caller.
        unsafe {
            match self {
                Self::Host(host) => host.release(info),
                Self::Device(device) => device.release(info),
            }
        }
    }

    /// Release only the staging half of a device allocation.
    ///
    /// Host allocations have no separate staging half and return an error.
    ///
    /// # Safety
    /// No live view or copy of `info.ptr` may access the staging mapping
    /// afterwards. [`Buffer::free_host`](crate::Buffer::free_host) upholds this.
    pub unsafe fn free_host(&self, info: &BufferInfo) -> Result<()> {
        match self {
            Self::Host(_) => Err(GpuError::InvalidState(
                "host allocations have no staging memory to release".to_string(),
            )),
            // SAFETY: forwarded to the caller.
            Self::Device(device) => unsafe { device.free_host(info) },
        }
    }

    /// Make host writes to `[offset, offset + size)` visible to the GPU.
    ///
    /// # Panics
    /// If `info` is not a live allocation of this allocator or the range
    /// exceeds it.
    pub fn invalidate(&self, info: &BufferInfo, offset: u64, size: u64) -> Result<()> {
        match self {
            Self::Host(host) => host.invalidate(info, offset, size),
            Self::Device(device) => device.invalidate(info, offset, size),
        }
    }

    /// Alignment applied to allocation and element sizes.
    pub fn alignment(&self) -> u64 {
        match self {
            Self::Host(host) => host.alignment(),
            Self::Device(device) => device.alignment(),
        }
    }

    /// Round `size` up to this allocator's alignment.
    pub fn align_size(&self, size: u64) -> u64 {
        align_size(size, self.alignment())
    }

    /// Whether `info` is a live allocation of this allocator.
    pub fn own(&self, info: &BufferInfo) -> bool {
        match self {
            Self::Host(host) => host.own(info),
            Self::Device(device) => device.own(info),
        }
    }

    /// Total bytes held by live allocations.
    pub fn size(&self) -> u64 {
        match self {
            Self::Host(host) => host.size(),
            Self::Device(device) => device.size(),
        }
    }
}

impl From<HostAllocator> for Allocator {
    fn from(host: HostAllocator) -> Self {
        Self::Host(host)
    }
}

impl From<DeviceAllocator> for Allocator {
    fn from(device: DeviceAllocator) -> Self {
        Self::Device(device)
    }
}

pub(crate) fn unknown_allocation(buffer: vk::Buffer) -> ! {
    panic!("unknown allocation: buffer {buffer:?} is not owned by this allocator")
}

pub(crate) fn check_range(info: &BufferInfo, offset: u64, size: u64) {
    assert!(
        offset.checked_add(size).is_some_and(|end| end <= info.size),
        "invalidate range {offset}..+{size} exceeds allocation of {} bytes",
        info.size
    );
}

/// A native buffer with its bound memory.
#[derive(Debug)]
pub(crate) struct NativeBuffer {
    pub buffer: vk::Buffer,
    pub memory: BoundMemory,
}

impl NativeBuffer {
    /// Create a buffer and back it with memory at `location`.
    pub fn create(
        raw: &dyn RawDevice,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self> {
        // SAFETY: size is non-zero, checked by the allocators.
        let buffer = unsafe { raw.create_buffer(size, usage)? };
        // SAFETY: the buffer was just created and is unbound.
        match unsafe { raw.allocate_buffer_memory(buffer, location, name) } {
            Ok(memory) => Ok(Self { buffer, memory }),
            Err(e) => {
                // SAFETY: the buffer was never used.
                unsafe { raw.destroy_buffer(buffer) };
                Err(e)
            }
        }
    }

    /// Like [`create`](Self::create), but fails unless the memory is host-mapped.
    pub fn create_mapped(
        raw: &dyn RawDevice,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<(Self, MappedPtr)> {
        let native = Self::create(raw, size, usage, MemoryLocation::CpuToGpu, name)?;
        match native.memory.mapped {
            Some(ptr) => Ok((native, ptr)),
            None => {
                native.destroy(raw)?;
                Err(GpuError::AllocationFailed(format!(
                    "{name}: memory is not host-visible"
                )))
            }
        }
    }

    /// Destroy the buffer and free its memory.
    pub fn destroy(self, raw: &dyn RawDevice) -> Result<()> {
        // SAFETY: allocators only destroy buffers they removed from their tables,
        // and device work on them has been waited for.
        unsafe {
            raw.destroy_buffer(self.buffer);
            raw.free_memory(self.memory)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{test_context, HeadlessConfig};

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_size(0, 256), 0);
        assert_eq!(align_size(1, 256), 256);
        assert_eq!(align_size(256, 256), 256);
        assert_eq!(align_size(257, 256), 512);
        assert_eq!(align_size(12, 0), 12);
    }

    #[test]
    fn checked_alignment_rejects_overflow() {
        assert_eq!(checked_align_size(257, 256).unwrap(), 512);
        assert_eq!(checked_align_size(u64::MAX, 0).unwrap(), u64::MAX);
        assert!(matches!(
            checked_align_size(u64::MAX - 10, 256),
            Err(GpuError::AllocationFailed(_))
        ));
    }

    #[test]
    fn huge_allocations_fail_cleanly() {
        let (device, context) = test_context(HeadlessConfig::default());
        for allocator in [Allocator::host(&context, 64), Allocator::device(&context, 64)] {
            assert!(matches!(
                allocator.allocate(u64::MAX - 1, vk::BufferUsageFlags::STORAGE_BUFFER),
                Err(GpuError::AllocationFailed(_))
            ));
            assert_eq!(allocator.size(), 0);
        }
        assert_eq!(device.stats().buffers, 0);
    }

    #[test]
    fn alignment_is_idempotent() {
        for alignment in [0, 1, 4, 16, 64, 256, 48] {
            for size in (0..2000).step_by(7) {
                let once = align_size(size, alignment);
                assert_eq!(align_size(once, alignment), once);
                assert!(once >= size);
            }
        }
    }

    #[test]
    fn allocate_then_own_then_free() {
        let (_device, context) = test_context(HeadlessConfig::default());
        for allocator in [Allocator::host(&context, 64), Allocator::device(&context, 64)] {
            for (size, usage) in [
                (1, vk::BufferUsageFlags::UNIFORM_BUFFER),
                (100, vk::BufferUsageFlags::STORAGE_BUFFER),
                (4096, vk::BufferUsageFlags::VERTEX_BUFFER),
            ] {
                let info = allocator.allocate(size, usage).unwrap();
                assert!(allocator.own(&info));
                assert_eq!(info.size, allocator.align_size(size));
                // SAFETY: `info.ptr` is not used again.
                unsafe { allocator.free(&info) }.unwrap();
                assert!(!allocator.own(&info));
            }
            assert_eq!(allocator.size(), 0);
        }
    }

    #[test]
    fn zero_sized_allocations_fail() {
        let (_device, context) = test_context(HeadlessConfig::default());
        for allocator in [Allocator::host(&context, 0), Allocator::device(&context, 0)] {
            assert!(matches!(
                allocator.allocate(0, vk::BufferUsageFlags::UNIFORM_BUFFER),
                Err(GpuError::ZeroSizedAllocation)
            ));
        }
    }

    #[test]
    #[should_panic(expected = "unknown allocation")]
    fn double_free_panics() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::host(&context, 0);
        let info = allocator
            .allocate(16, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();
        unsafe {
            allocator.free(&info).unwrap();
            let _ = allocator.free(&info);
        }
    }

    #[test]
    #[should_panic(expected = "unknown allocation")]
    fn foreign_allocation_panics() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let ours = Allocator::device(&context, 0);
        let theirs = Allocator::device(&context, 0);
        let info = theirs
            .allocate(16, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();
        let _ = ours.invalidate(&info, 0, 16);
    }

    #[test]
    fn release_only_frees_owned() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::host(&context, 0);
        let info = allocator
            .allocate(16, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();
        unsafe {
            assert!(allocator.release(&info).unwrap());
            assert!(!allocator.release(&info).unwrap());
        }
    }

    #[test]
    fn host_allocations_have_no_staging_half() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::host(&context, 0);
        let info = allocator
            .allocate(16, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();
        assert!(matches!(
            unsafe { allocator.free_host(&info) },
            Err(GpuError::InvalidState(_))
        ));
        assert!(allocator.own(&info));
    }
}
