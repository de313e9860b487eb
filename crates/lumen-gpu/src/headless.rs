//! Software [`RawDevice`] for tests and machines without a GPU.
//!
//! Memory lives in host allocations, copy commands are executed when their
//! command buffer is submitted, and fences are signaled by the submit itself.
//! While the queues are stalled, submitted work is held back until they are
//! resumed. The device records what it was asked to do so tests can inspect it.

use crate::capabilities::{GpuCapabilities, GpuVendor};
use crate::error::{GpuError, Result};
use crate::queue::{QueueFamilyRoles, QueueRecord};
use crate::raw::{
    find_memory_type, required_memory_flags, Backend, BoundMemory, MappedPtr, RawDevice,
    Submission,
};
use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A queue family exposed by the headless device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyConfig {
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
}

/// Configuration of a [`HeadlessDevice`].
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Queue families, in family index order.
    pub queue_families: Vec<QueueFamilyConfig>,
    /// Total bytes of memory that can be allocated (None for unlimited).
    pub memory_budget: Option<u64>,
    /// Whether host-visible memory is coherent.
    pub coherent_host_memory: bool,
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub non_coherent_atom_size: u64,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            queue_families: vec![
                QueueFamilyConfig {
                    flags: vk::QueueFlags::GRAPHICS
                        | vk::QueueFlags::COMPUTE
                        | vk::QueueFlags::TRANSFER,
                    queue_count: 1,
                },
                QueueFamilyConfig {
                    flags: vk::QueueFlags::TRANSFER,
                    queue_count: 2,
                },
            ],
            memory_budget: None,
            coherent_host_memory: false,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 16,
            non_coherent_atom_size: 64,
        }
    }
}

/// A queue submission observed by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub fence: vk::Fence,
}

/// A flush of mapped memory observed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRecord {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
}

/// Live object counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeadlessStats {
    pub buffers: usize,
    pub memory_objects: usize,
    pub allocated_bytes: u64,
    pub fences: usize,
    pub command_pools: usize,
    pub command_buffers: usize,
}

/// Zero-initialized host allocation standing in for a `VkDeviceMemory`.
struct HostBlock {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the block is plain bytes owned by the device state.
unsafe impl Send for HostBlock {}

impl HostBlock {
    fn new(len: usize) -> Self {
        let ptr = NonNull::from(Box::leak(vec![0u8; len].into_boxed_slice())).cast::<u8>();
        Self { ptr, len }
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from the boxed slice leaked in `new`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

struct BufferState {
    size: u64,
    binding: Option<(vk::DeviceMemory, u64)>,
}

struct MemoryState {
    block: HostBlock,
    host_visible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandState {
    Initial,
    Recording,
    Executable,
    Invalid,
}

type CopyOp = (vk::Buffer, vk::Buffer, vk::BufferCopy);

struct CommandBufferState {
    pool: vk::CommandPool,
    state: CommandState,
    one_time: bool,
    copies: Vec<CopyOp>,
}

/// Work submitted while the queues were stalled.
struct Deferred {
    copies: Vec<CopyOp>,
    fence: vk::Fence,
}

#[derive(Default)]
struct State {
    buffers: HashMap<vk::Buffer, BufferState>,
    memories: HashMap<vk::DeviceMemory, MemoryState>,
    fences: HashMap<vk::Fence, bool>,
    pools: HashMap<vk::CommandPool, u32>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferState>,
    allocated_bytes: u64,
    submissions: Vec<SubmissionRecord>,
    flushes: Vec<FlushRecord>,
    deferred: Vec<Deferred>,
}

impl State {
    /// Host address and size of the memory bound to `buffer`.
    fn resolve(&self, buffer: vk::Buffer) -> Option<(*mut u8, u64)> {
        let state = self.buffers.get(&buffer)?;
        let (memory, offset) = state.binding?;
        let memory = self.memories.get(&memory)?;
        // SAFETY: the binding was validated to fit the block when it was made.
        Some((unsafe { memory.block.ptr.as_ptr().add(offset as usize) }, state.size))
    }

    /// Perform `copies` and signal `fence`.
    fn complete(&mut self, copies: &[CopyOp], fence: vk::Fence) -> Result<()> {
        for &(src, dst, region) in copies {
            let (Some((src_ptr, src_size)), Some((dst_ptr, dst_size))) =
                (self.resolve(src), self.resolve(dst))
            else {
                return Err(vk::Result::ERROR_UNKNOWN.into());
            };
            if region.src_offset + region.size > src_size
                || region.dst_offset + region.size > dst_size
            {
                return Err(vk::Result::ERROR_UNKNOWN.into());
            }
            // SAFETY: both ranges were checked against the bound sizes above.
            unsafe {
                std::ptr::copy(
                    src_ptr.add(region.src_offset as usize),
                    dst_ptr.add(region.dst_offset as usize),
                    region.size as usize,
                );
            }
        }
        if fence != vk::Fence::null() {
            *self.fences.get_mut(&fence).ok_or(vk::Result::ERROR_UNKNOWN)? = true;
        }
        Ok(())
    }
}

/// In-process device emulating the native primitives.
pub struct HeadlessDevice {
    config: HeadlessConfig,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    next_handle: AtomicU64,
    lost: AtomicBool,
    stalled: AtomicBool,
    state: Mutex<State>,
}

impl HeadlessDevice {
    /// Create a device with the given configuration.
    pub fn new(config: HeadlessConfig) -> Self {
        let host_flags = if config.coherent_host_memory {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::HOST_VISIBLE
        };

        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 2,
            ..Default::default()
        };
        let heap_size = config.memory_budget.unwrap_or(8 << 30);
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: heap_size,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: heap_size,
            flags: vk::MemoryHeapFlags::empty(),
        };
        memory_properties.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        memory_properties.memory_types[1] = vk::MemoryType {
            property_flags: host_flags,
            heap_index: 1,
        };

        Self {
            config,
            memory_properties,
            next_handle: AtomicU64::new(1),
            lost: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        }
    }

    /// Capabilities reported for this device.
    pub fn capabilities(&self) -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Other(0),
            device_name: "Lumen headless device".to_string(),
            api_version: vk::API_VERSION_1_1,
            device_local_memory_mb: crate::capabilities::heap_megabytes(
                &self.memory_properties,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ),
            host_visible_memory_mb: crate::capabilities::heap_megabytes(
                &self.memory_properties,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
            max_memory_allocation_count: 4096,
            min_uniform_buffer_offset_alignment: self.config.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: self.config.min_storage_buffer_offset_alignment,
            non_coherent_atom_size: self.config.non_coherent_atom_size,
        }
    }

    /// Memory types and heaps of this device.
    pub fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    /// Queue families with their assigned roles.
    pub fn queue_roles(&self) -> QueueFamilyRoles {
        let flags: Vec<vk::QueueFlags> =
            self.config.queue_families.iter().map(|f| f.flags).collect();
        QueueFamilyRoles::assign(&flags)
    }

    /// Records for every queue of every family that serves a role.
    pub fn queue_records(&self) -> Vec<QueueRecord> {
        self.queue_roles().records(
            |family| self.config.queue_families[family as usize].queue_count,
            |family, index| {
                vk::Queue::from_raw(((u64::from(family) + 1) << 16) | u64::from(index))
            },
        )
    }

    /// Make every later wait and submit fail as if the device was lost.
    pub fn lose_device(&self) {
        self.lost.store(true, Ordering::Release);
    }

    /// Hold back submitted work: fences stay unsignaled and copies are not
    /// performed until [`resume_queues`](Self::resume_queues).
    pub fn stall_queues(&self) {
        self.stalled.store(true, Ordering::Release);
    }

    /// Perform the work held back since [`stall_queues`](Self::stall_queues)
    /// and run later submissions immediately again.
    pub fn resume_queues(&self) {
        let mut state = self.state.lock();
        self.stalled.store(false, Ordering::Release);
        for deferred in std::mem::take(&mut state.deferred) {
            if let Err(e) = state.complete(&deferred.copies, deferred.fence) {
                tracing::warn!("dropping held back work: {e}");
            }
        }
    }

    /// Submissions in the order they were made.
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    /// Flushes in the order they were made.
    pub fn flushes(&self) -> Vec<FlushRecord> {
        self.state.lock().flushes.clone()
    }

    /// Live object counts.
    pub fn stats(&self) -> HeadlessStats {
        let state = self.state.lock();
        HeadlessStats {
            buffers: state.buffers.len(),
            memory_objects: state.memories.len(),
            allocated_bytes: state.allocated_bytes,
            fences: state.fences.len(),
            command_pools: state.pools.len(),
            command_buffers: state.command_buffers.len(),
        }
    }

    /// Current contents of the memory bound to `buffer`.
    pub fn read_buffer(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let (ptr, size) = state.resolve(buffer)?;
        // SAFETY: `resolve` returns a pointer to `size` initialized bytes.
        Some(unsafe { std::slice::from_raw_parts(ptr, size as usize) }.to_vec())
    }

    /// Whether `cmd` has been fully recorded and not yet consumed.
    pub fn is_executable(&self, cmd: vk::CommandBuffer) -> bool {
        self.state
            .lock()
            .command_buffers
            .get(&cmd)
            .is_some_and(|c| c.state == CommandState::Executable)
    }

    fn next<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn check_lost(&self) -> VkResult<()> {
        if self.lost.load(Ordering::Acquire) {
            Err(vk::Result::ERROR_DEVICE_LOST)
        } else {
            Ok(())
        }
    }
}

impl RawDevice for HeadlessDevice {
    fn backend(&self) -> Backend {
        Backend::Headless
    }

    unsafe fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        if size == 0 {
            return Err(GpuError::ZeroSizedAllocation);
        }
        let buffer = self.next();
        self.state.lock().buffers.insert(
            buffer,
            BufferState {
                size,
                binding: None,
            },
        );
        Ok(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().buffers.remove(&buffer);
    }

    unsafe fn allocate_buffer_memory(
        &self,
        buffer: vk::Buffer,
        location: MemoryLocation,
        _name: &str,
    ) -> Result<BoundMemory> {
        let mut state = self.state.lock();
        let size = match state.buffers.get(&buffer) {
            Some(b) if b.binding.is_none() => b.size,
            Some(_) => return Err(GpuError::InvalidState("buffer already bound".to_string())),
            None => return Err(vk::Result::ERROR_UNKNOWN.into()),
        };

        let type_index = find_memory_type(
            &self.memory_properties,
            0b11,
            required_memory_flags(location),
        )
        .ok_or_else(|| GpuError::AllocationFailed(format!("no memory type for {location:?}")))?;

        if let Some(budget) = self.config.memory_budget {
            if state.allocated_bytes + size > budget {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
            }
        }

        let flags = self.memory_properties.memory_types[type_index as usize].property_flags;
        let host_visible = flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let block = HostBlock::new(size as usize);
        let mapped = host_visible.then(|| MappedPtr::new(block.ptr));

        let memory: vk::DeviceMemory = self.next();
        state.memories.insert(
            memory,
            MemoryState {
                block,
                host_visible,
            },
        );
        state.allocated_bytes += size;
        if let Some(b) = state.buffers.get_mut(&buffer) {
            b.binding = Some((memory, 0));
        }

        Ok(BoundMemory {
            memory,
            offset: 0,
            size,
            mapped,
            coherent: flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            allocation: None,
        })
    }

    unsafe fn free_memory(&self, memory: BoundMemory) -> Result<()> {
        let mut state = self.state.lock();
        let freed = state
            .memories
            .remove(&memory.memory)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        state.allocated_bytes -= freed.block.len as u64;
        Ok(())
    }

    unsafe fn flush_memory(&self, memory: &BoundMemory, offset: u64, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        match state.memories.get(&memory.memory) {
            Some(m) if m.host_visible && offset + size <= m.block.len as u64 => {}
            _ => return Err(vk::Result::ERROR_MEMORY_MAP_FAILED.into()),
        }
        state.flushes.push(FlushRecord {
            memory: memory.memory,
            offset,
            size,
        });
        Ok(())
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence = self.next();
        self.state.lock().fences.insert(fence, signaled);
        Ok(fence)
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    /// Work completes during submit or on resume, never during a wait, so
    /// waiting on an unsignaled fence times out whatever the timeout.
    unsafe fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        self.check_lost()?;
        match self.state.lock().fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => Err(vk::Result::TIMEOUT),
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.lock();
        let signaled = state.fences.get_mut(&fence).ok_or(vk::Result::ERROR_UNKNOWN)?;
        *signaled = false;
        Ok(())
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        self.check_lost()?;
        Ok(*self
            .state
            .lock()
            .fences
            .get(&fence)
            .ok_or(vk::Result::ERROR_UNKNOWN)?)
    }

    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        if queue_family as usize >= self.config.queue_families.len() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED.into());
        }
        let pool = self.next();
        self.state.lock().pools.insert(pool, queue_family);
        Ok(pool)
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.pools.remove(&pool);
        state.command_buffers.retain(|_, c| c.pool != pool);
    }

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool) {
            return Err(vk::Result::ERROR_UNKNOWN.into());
        }
        let buffers: Vec<vk::CommandBuffer> = (0..count).map(|_| self.next()).collect();
        for &cmd in &buffers {
            state.command_buffers.insert(
                cmd,
                CommandBufferState {
                    pool,
                    state: CommandState::Initial,
                    one_time: false,
                    copies: Vec::new(),
                },
            );
        }
        Ok(buffers)
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cmd in buffers {
            if state.command_buffers.get(cmd).is_some_and(|c| c.pool == pool) {
                state.command_buffers.remove(cmd);
            }
        }
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let cmd = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        cmd.state = CommandState::Recording;
        cmd.one_time = flags.contains(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        cmd.copies.clear();
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&cmd) {
            Some(c) if c.state == CommandState::Recording => {
                c.state = CommandState::Executable;
                Ok(())
            }
            _ => Err(vk::Result::ERROR_UNKNOWN.into()),
        }
    }

    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let mut state = self.state.lock();
        if let Some(c) = state.command_buffers.get_mut(&cmd) {
            if c.state == CommandState::Recording {
                c.copies.extend(regions.iter().map(|&r| (src, dst, r)));
            }
        }
    }

    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submissions: &[Submission],
        fence: vk::Fence,
    ) -> Result<()> {
        self.check_lost()?;
        let mut state = self.state.lock();

        let mut executed = Vec::new();
        let mut copies = Vec::new();
        for cmd in submissions.iter().flat_map(|s| &s.command_buffers) {
            match state.command_buffers.get_mut(cmd) {
                Some(c) if c.state == CommandState::Executable => {
                    copies.extend_from_slice(&c.copies);
                    if c.one_time {
                        c.state = CommandState::Invalid;
                    }
                }
                _ => return Err(vk::Result::ERROR_UNKNOWN.into()),
            }
            executed.push(*cmd);
        }

        if self.stalled.load(Ordering::Acquire) {
            state.deferred.push(Deferred { copies, fence });
        } else {
            state.complete(&copies, fence)?;
        }
        state.submissions.push(SubmissionRecord {
            queue,
            command_buffers: executed,
            fence,
        });
        Ok(())
    }

    unsafe fn device_wait_idle(&self) -> Result<()> {
        self.check_lost()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_budget_is_enforced() {
        let device = HeadlessDevice::new(HeadlessConfig {
            memory_budget: Some(1024),
            ..HeadlessConfig::default()
        });
        unsafe {
            let a = device.create_buffer(1000, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
            let memory = device
                .allocate_buffer_memory(a, MemoryLocation::GpuOnly, "a")
                .unwrap();
            assert!(memory.mapped.is_none());

            let b = device.create_buffer(100, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
            let err = device
                .allocate_buffer_memory(b, MemoryLocation::CpuToGpu, "b")
                .unwrap_err();
            assert!(matches!(
                err,
                GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            ));

            device.free_memory(memory).unwrap();
            device.destroy_buffer(a);
            device.destroy_buffer(b);
        }
        assert_eq!(device.stats(), HeadlessStats::default());
    }

    #[test]
    fn submitted_copies_move_bytes() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        unsafe {
            let src = device.create_buffer(8, vk::BufferUsageFlags::TRANSFER_SRC).unwrap();
            let dst = device.create_buffer(8, vk::BufferUsageFlags::TRANSFER_DST).unwrap();
            let src_mem = device
                .allocate_buffer_memory(src, MemoryLocation::CpuToGpu, "src")
                .unwrap();
            let _dst_mem = device
                .allocate_buffer_memory(dst, MemoryLocation::GpuOnly, "dst")
                .unwrap();

            let mapped = src_mem.mapped.unwrap();
            std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), mapped.add(2), 4);

            let pool = device
                .create_command_pool(1, vk::CommandPoolCreateFlags::empty())
                .unwrap();
            let cmd = device
                .allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 1)
                .unwrap()[0];
            device
                .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .unwrap();
            device.cmd_copy_buffer(
                cmd,
                src,
                dst,
                &[vk::BufferCopy {
                    src_offset: 2,
                    dst_offset: 2,
                    size: 4,
                }],
            );
            device.end_command_buffer(cmd).unwrap();

            let fence = device.create_fence(false).unwrap();
            device
                .queue_submit(vk::Queue::from_raw(1), &[Submission::commands(vec![cmd])], fence)
                .unwrap();
            device.wait_for_fence(fence, 0).unwrap();
            assert!(!device.is_executable(cmd));

            assert_eq!(
                device.read_buffer(dst).unwrap(),
                vec![0, 0, 1, 2, 3, 4, 0, 0]
            );
        }
    }

    #[test]
    fn default_queues_route_transfer_to_dedicated_family() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let records = device.queue_records();
        assert_eq!(records.len(), 3);
        let transfer: Vec<_> = records
            .iter()
            .filter(|r| r.flags.contains(vk::QueueFlags::TRANSFER))
            .collect();
        assert_eq!(transfer.len(), 2);
        assert!(transfer.iter().all(|r| r.family_index == 1));
    }
}

/// Headless context shared by the unit tests of other modules.
#[cfg(test)]
pub(crate) fn test_context(
    config: HeadlessConfig,
) -> (
    std::sync::Arc<HeadlessDevice>,
    std::sync::Arc<crate::context::GpuContext>,
) {
    let device = std::sync::Arc::new(HeadlessDevice::new(config));
    let context = crate::context::GpuContextBuilder::new()
        .build_headless(device.clone())
        .expect("headless context");
    (device, context)
}
