//! Vulkan instance creation and physical device selection.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance without presentation extensions.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Lumen")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Missing layers are skipped rather than failing instance creation
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers.iter().any(|props| {
                props.layer_name_as_c_str().is_ok_and(|name| name == *layer)
            });
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();
    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let (create_flags, extension_names) = (
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR,
        vec![ash::khr::portability_enumeration::NAME.as_ptr()],
    );
    #[cfg(not(target_os = "macos"))]
    let (create_flags, extension_names): (_, Vec<*const std::ffi::c_char>) =
        (vk::InstanceCreateFlags::empty(), vec![]);

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None)? };
    Ok(instance)
}

/// Select the best physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    devices
        .into_iter()
        .map(|device| (unsafe { score_physical_device(instance, device) }, device))
        .filter(|(score, _)| *score >= 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection. Negative scores are unusable.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    let properties = unsafe { instance.get_physical_device_properties(device) };

    let api_version = properties.api_version;
    if vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 1 {
        return -1;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    // Prefer more VRAM, +1 per GB
    let memory = unsafe { instance.get_physical_device_memory_properties(device) };
    let vram_mb =
        crate::capabilities::heap_megabytes(&memory, vk::MemoryPropertyFlags::DEVICE_LOCAL);
    score += i64::try_from(vram_mb / 1024).unwrap_or(i64::MAX / 2);

    // Prefer devices with a dedicated transfer family
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    if families.iter().any(|f| {
        f.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !f
                .queue_flags
                .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    }) {
        score += 10;
    }

    score
}
