//! [`RawDevice`] implementation on top of ash and gpu-allocator.

use crate::error::{GpuError, Result};
use crate::raw::{Backend, BoundMemory, MappedPtr, RawDevice, Submission};
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ptr::NonNull;

/// A logical Vulkan device with its memory allocator.
///
/// Owns the entry, instance and device; they are destroyed in reverse order
/// of creation when the last reference goes away.
pub struct VulkanDevice {
    // Entry must be kept alive for the lifetime of the device
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    allocator: Mutex<Option<Allocator>>,
    non_coherent_atom_size: u64,
}

impl VulkanDevice {
    /// Wrap a freshly created device and set up its allocator.
    ///
    /// # Safety
    /// `device` must have been created from `instance` and `physical_device`.
    /// Ownership of both passes to this call, also when it fails.
    pub unsafe fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        non_coherent_atom_size: u64,
    ) -> Result<Self> {
        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            allocator: Mutex::new(Some(allocator)),
            non_coherent_atom_size,
        })
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get a queue created together with the device.
    ///
    /// # Safety
    /// The family and index must have been requested at device creation.
    pub unsafe fn queue(&self, family: u32, index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, index) }
    }
}

/// Expand `[offset, offset + size)` to `atom` boundaries inside a binding that
/// starts at `base` and spans `limit` bytes.
///
/// Returns the absolute offset and the size, which is `vk::WHOLE_SIZE` when the
/// rounded range would run past the binding.
pub fn atom_range(base: u64, offset: u64, size: u64, atom: u64, limit: u64) -> (u64, u64) {
    let atom = atom.max(1);
    let start = (base + offset) / atom * atom;
    let end = (base + offset + size).div_ceil(atom) * atom;
    if end > base + limit {
        (start, vk::WHOLE_SIZE)
    } else {
        (start, end - start)
    }
}

impl RawDevice for VulkanDevice {
    fn backend(&self) -> Backend {
        Backend::Vulkan
    }

    unsafe fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        Ok(unsafe { self.device.create_buffer(&buffer_info, None)? })
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    unsafe fn allocate_buffer_memory(
        &self,
        buffer: vk::Buffer,
        location: MemoryLocation,
        name: &str,
    ) -> Result<BoundMemory> {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let mut allocator = self.allocator.lock();
        let allocator = allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?;

        let allocation = allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::DedicatedBuffer(buffer),
        })?;

        let memory = unsafe { allocation.memory() };
        if let Err(err) = unsafe {
            self.device
                .bind_buffer_memory(buffer, memory, allocation.offset())
        } {
            allocator.free(allocation)?;
            return Err(err.into());
        }

        Ok(BoundMemory {
            memory,
            offset: allocation.offset(),
            size: allocation.size(),
            mapped: allocation
                .mapped_ptr()
                .map(|p| MappedPtr::new(NonNull::cast(p))),
            coherent: allocation
                .memory_properties()
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT),
            allocation: Some(allocation),
        })
    }

    unsafe fn free_memory(&self, memory: BoundMemory) -> Result<()> {
        if let Some(allocation) = memory.allocation {
            self.allocator
                .lock()
                .as_mut()
                .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
                .free(allocation)?;
        }
        Ok(())
    }

    unsafe fn flush_memory(&self, memory: &BoundMemory, offset: u64, size: u64) -> Result<()> {
        if memory.coherent {
            return Ok(());
        }

        let (start, size) = atom_range(
            memory.offset,
            offset,
            size,
            self.non_coherent_atom_size,
            memory.size,
        );
        let range = vk::MappedMemoryRange::default()
            .memory(memory.memory)
            .offset(start)
            .size(size);
        unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&create_info, None)? })
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    unsafe fn fence_status(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    unsafe fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        Ok(unsafe { self.device.create_command_pool(&create_info, None)? })
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    unsafe fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);

        Ok(unsafe { self.device.allocate_command_buffers(&alloc_info)? })
    }

    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        unsafe { self.device.free_command_buffers(pool, buffers) };
    }

    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info)? };
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd)? };
        Ok(())
    }

    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) };
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submissions: &[Submission],
        fence: vk::Fence,
    ) -> Result<()> {
        let submit_infos: Vec<vk::SubmitInfo<'_>> = submissions
            .iter()
            .map(|s| {
                vk::SubmitInfo::default()
                    .command_buffers(&s.command_buffers)
                    .wait_semaphores(&s.wait_semaphores)
                    .wait_dst_stage_mask(&s.wait_stages)
                    .signal_semaphores(&s.signal_semaphores)
            })
            .collect();

        unsafe { self.device.queue_submit(queue, &submit_infos, fence)? };
        Ok(())
    }

    unsafe fn device_wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // The allocator frees its VkDeviceMemory blocks and must go before the device
            drop(self.allocator.lock().take());

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_range_rounds_outwards() {
        assert_eq!(atom_range(0, 10, 20, 64, 256), (0, 64));
        assert_eq!(atom_range(0, 64, 64, 64, 256), (64, 64));
        assert_eq!(atom_range(128, 70, 10, 64, 512), (192, 64));
    }

    #[test]
    fn atom_range_clamps_to_whole_size() {
        assert_eq!(atom_range(0, 200, 40, 64, 250), (192, vk::WHOLE_SIZE));
    }

    #[test]
    fn zero_atom_is_byte_granular() {
        assert_eq!(atom_range(4, 3, 5, 0, 100), (7, 5));
    }
}
