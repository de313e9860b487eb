//! GPU capability detection.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities relevant to buffer memory management.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,

    // Memory info
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Host-visible memory in MB
    pub host_visible_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,

    // Alignment limits
    /// Required alignment of uniform buffer offsets
    pub min_uniform_buffer_offset_alignment: u64,
    /// Required alignment of storage buffer offsets
    pub min_storage_buffer_offset_alignment: u64,
    /// Granularity of flushes of non-coherent memory
    pub non_coherent_atom_size: u64,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let (properties, memory_properties) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
            )
        };

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let limits = properties.limits;
        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            device_local_memory_mb: heap_megabytes(
                &memory_properties,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ),
            host_visible_memory_mb: heap_megabytes(
                &memory_properties,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ),
            max_memory_allocation_count: limits.max_memory_allocation_count,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            non_coherent_atom_size: limits.non_coherent_atom_size,
        }
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM, {} MB host-visible",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.host_visible_memory_mb,
        )
    }
}

/// Total size in MB of heaps backing at least one memory type with `flags`.
pub fn heap_megabytes(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    flags: vk::MemoryPropertyFlags,
) -> u64 {
    let mut heaps: Vec<u32> = memory_properties
        .memory_types
        .iter()
        .take(memory_properties.memory_type_count as usize)
        .filter(|ty| ty.property_flags.contains(flags))
        .map(|ty| ty.heap_index)
        .collect();
    heaps.sort_unstable();
    heaps.dedup();

    heaps
        .into_iter()
        .map(|heap| memory_properties.memory_heaps[heap as usize].size / (1024 * 1024))
        .sum()
}
