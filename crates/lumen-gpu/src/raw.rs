//! Native device primitives.
//!
//! [`RawDevice`] is the seam between the memory layer and the graphics API.
//! [`VulkanDevice`](crate::vulkan::VulkanDevice) forwards to ash and
//! gpu-allocator; [`HeadlessDevice`](crate::headless::HeadlessDevice) emulates
//! the same calls in host memory.

use crate::error::Result;
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;

/// Which implementation sits behind a [`RawDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Vulkan,
    Headless,
}

/// Host address of mapped device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer is only an address into a mapping owned by an allocator;
// access to the pointee is synchronized by whoever owns the allocation.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Pointer `offset` bytes past the start of the mapping.
    ///
    /// # Safety
    /// `offset` must stay inside the mapping.
    pub unsafe fn add(self, offset: u64) -> *mut u8 {
        unsafe { self.0.as_ptr().add(offset as usize) }
    }
}

/// Memory allocated for and bound to a single buffer.
#[derive(Debug)]
pub struct BoundMemory {
    /// Native memory object.
    pub memory: vk::DeviceMemory,
    /// Offset of the binding inside `memory`.
    pub offset: u64,
    /// Size of the binding in bytes.
    pub size: u64,
    /// Host mapping, present for host-visible memory.
    pub mapped: Option<MappedPtr>,
    /// Whether host writes are visible to the device without a flush.
    pub coherent: bool,
    pub(crate) allocation: Option<Allocation>,
}

/// One batch of a queue submission.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

impl Submission {
    /// A batch that only executes the given command buffers.
    pub fn commands(command_buffers: impl Into<Vec<vk::CommandBuffer>>) -> Self {
        Self {
            command_buffers: command_buffers.into(),
            ..Default::default()
        }
    }
}

/// Native primitives the memory layer is built on.
///
/// All handles passed to a method must have been created by the same device,
/// and callers uphold the Vulkan external synchronization rules (one thread at
/// a time per command pool and per queue).
pub trait RawDevice: Send + Sync {
    /// Backend identification, for diagnostics.
    fn backend(&self) -> Backend;

    /// # Safety
    /// `size` must be non-zero.
    unsafe fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer>;

    /// # Safety
    /// The buffer must not be in use and its memory must be freed separately.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    /// Allocate memory for `buffer`, bind it and map it if host-visible.
    ///
    /// # Safety
    /// The buffer must be valid and not yet bound.
    unsafe fn allocate_buffer_memory(
        &self,
        buffer: vk::Buffer,
        location: MemoryLocation,
        name: &str,
    ) -> Result<BoundMemory>;

    /// # Safety
    /// The memory must not be in use by the device.
    unsafe fn free_memory(&self, memory: BoundMemory) -> Result<()>;

    /// Make host writes to `[offset, offset + size)` of `memory` visible to the device.
    ///
    /// # Safety
    /// The memory must be mapped.
    unsafe fn flush_memory(&self, memory: &BoundMemory, offset: u64, size: u64) -> Result<()>;

    /// # Safety
    /// The device must be valid.
    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;

    /// # Safety
    /// The fence must not be in use.
    unsafe fn destroy_fence(&self, fence: vk::Fence);

    /// # Safety
    /// The fence must be valid.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;

    /// # Safety
    /// The fence must not be pending on a queue.
    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    /// # Safety
    /// The fence must be valid.
    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool>;

    /// # Safety
    /// `queue_family` must be a family the device was created with.
    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool>;

    /// # Safety
    /// No command buffer of the pool may be in use.
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);

    /// # Safety
    /// The pool must be externally synchronized.
    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;

    /// # Safety
    /// The pool must be externally synchronized and the buffers not in use.
    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);

    /// # Safety
    /// The owning pool must be externally synchronized.
    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()>;

    /// # Safety
    /// The owning pool must be externally synchronized.
    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    /// # Safety
    /// `cmd` must be recording; regions must lie inside both buffers.
    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    /// # Safety
    /// The queue must be externally synchronized.
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submissions: &[Submission],
        fence: vk::Fence,
    ) -> Result<()>;

    /// # Safety
    /// No queue may be in use by another thread.
    unsafe fn device_wait_idle(&self) -> Result<()>;
}

/// Required property flags for a memory location.
pub fn required_memory_flags(location: MemoryLocation) -> vk::MemoryPropertyFlags {
    match location {
        MemoryLocation::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        MemoryLocation::CpuToGpu | MemoryLocation::GpuToCpu => {
            vk::MemoryPropertyFlags::HOST_VISIBLE
        }
        MemoryLocation::Unknown => vk::MemoryPropertyFlags::empty(),
    }
}

/// Index of the first memory type allowed by `type_bits` that has all `required` flags.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    properties
        .memory_types
        .iter()
        .take(properties.memory_type_count as usize)
        .enumerate()
        .find(|(i, ty)| type_bits & (1u32 << i) != 0 && ty.property_flags.contains(required))
        .map(|(i, _)| i as u32)
}
