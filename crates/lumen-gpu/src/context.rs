//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::command::{CommandPool, CommandPoolMode};
use crate::error::{GpuError, Result};
use crate::headless::HeadlessDevice;
use crate::instance::{create_instance, select_physical_device};
use crate::queue::{QueueContainer, QueueFamilyRoles, QueueRecord};
use crate::raw::{Backend, RawDevice};
use crate::vulkan::VulkanDevice;
use ash::vk;
use std::sync::Arc;

/// The device together with its queues and the transfer command pool.
///
/// Allocators, fences and pools keep the device alive through shared
/// references, so the context can be dropped before them.
pub struct GpuContext {
    raw: Arc<dyn RawDevice>,
    capabilities: GpuCapabilities,
    queues: QueueContainer,
    transfer_pool: CommandPool,
}

impl GpuContext {
    /// Get the native device.
    pub fn raw(&self) -> &Arc<dyn RawDevice> {
        &self.raw
    }

    /// Which backend the context runs on.
    pub fn backend(&self) -> Backend {
        self.raw.backend()
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the queues of the device.
    pub fn queues(&self) -> &QueueContainer {
        &self.queues
    }

    /// Command pool for the transfer queue family.
    pub fn transfer_pool(&self) -> &CommandPool {
        &self.transfer_pool
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: queues are only used through `QueueContainer`, which serializes submits.
        unsafe { self.raw.device_wait_idle() }
    }

    fn assemble(
        raw: Arc<dyn RawDevice>,
        capabilities: GpuCapabilities,
        records: Vec<QueueRecord>,
        pool_mode: CommandPoolMode,
    ) -> Result<Arc<Self>> {
        let queues = QueueContainer::new(Arc::clone(&raw), records);
        let transfer_family = queues
            .family_for(vk::QueueFlags::TRANSFER)
            .ok_or(GpuError::NoSuitableDevice)?;

        let transfer_pool = CommandPool::new(
            Arc::clone(&raw),
            transfer_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            pool_mode,
        )?;

        tracing::info!(
            backend = ?raw.backend(),
            queues = queues.records().count(),
            transfer_family,
            "Selected GPU: {}",
            capabilities.summary()
        );

        Ok(Arc::new(Self {
            raw,
            capabilities,
            queues,
            transfer_pool,
        }))
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            tracing::warn!("device_wait_idle failed during shutdown: {e}");
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    max_queues_per_family: u32,
    command_pool_mode: CommandPoolMode,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Lumen".to_string(),
            enable_validation: cfg!(debug_assertions),
            max_queues_per_family: 2,
            command_pool_mode: CommandPoolMode::default(),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Upper bound on the queues created in each used family (at least 1).
    pub fn max_queues_per_family(mut self, count: u32) -> Self {
        self.max_queues_per_family = count.max(1);
        self
    }

    /// Access mode of the transfer command pool.
    pub fn command_pool_mode(mut self, mode: CommandPoolMode) -> Self {
        self.command_pool_mode = mode;
        self
    }

    /// Build the GPU context on a Vulkan device.
    pub fn build(self) -> Result<Arc<GpuContext>> {
        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let selected = unsafe { select_physical_device(&instance) }.and_then(|physical_device| {
            let families = unsafe {
                instance.get_physical_device_queue_family_properties(physical_device)
            };
            let flags: Vec<vk::QueueFlags> = families.iter().map(|f| f.queue_flags).collect();
            let roles = QueueFamilyRoles::assign(&flags);
            if roles.transfer.is_none() {
                return Err(GpuError::NoSuitableDevice);
            }
            Ok((physical_device, families, roles))
        });
        let (physical_device, families, roles) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        let max_queues = self.max_queues_per_family;
        let queue_count =
            |family: u32| families[family as usize].queue_count.clamp(1, max_queues);

        let device = match unsafe { create_device(&instance, physical_device, &roles, queue_count) }
        {
            Ok(device) => device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let vulkan = unsafe {
            VulkanDevice::new(
                entry,
                instance,
                physical_device,
                device,
                capabilities.non_coherent_atom_size,
            )
        }?;
        let records = roles.records(queue_count, |family, index| unsafe {
            vulkan.queue(family, index)
        });

        GpuContext::assemble(
            Arc::new(vulkan),
            capabilities,
            records,
            self.command_pool_mode,
        )
    }

    /// Build the GPU context on a headless device.
    pub fn build_headless(self, device: Arc<HeadlessDevice>) -> Result<Arc<GpuContext>> {
        let capabilities = device.capabilities();
        let records: Vec<QueueRecord> = device
            .queue_records()
            .into_iter()
            .filter(|r| r.queue_index < self.max_queues_per_family)
            .collect();

        GpuContext::assemble(device, capabilities, records, self.command_pool_mode)
    }
}

/// Create the logical device with `queue_count(family)` queues in every used family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    roles: &QueueFamilyRoles,
    queue_count: impl Fn(u32) -> u32,
) -> Result<ash::Device> {
    let priorities: Vec<Vec<f32>> = roles
        .families()
        .into_iter()
        .map(|family| vec![1.0_f32; queue_count(family) as usize])
        .collect();

    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = roles
        .families()
        .into_iter()
        .zip(&priorities)
        .map(|(family, priorities)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(priorities)
        })
        .collect();

    let device_create_info =
        vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None)? };
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessConfig;

    #[test]
    fn headless_context_uses_transfer_family() {
        let device = Arc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let context = GpuContextBuilder::new()
            .build_headless(device.clone())
            .unwrap();

        assert_eq!(context.backend(), Backend::Headless);
        assert_eq!(context.transfer_pool().queue_family(), 1);
        assert_eq!(
            context.transfer_pool().mode(),
            CommandPoolMode::Concurrent
        );
        assert_eq!(context.capabilities().min_uniform_buffer_offset_alignment, 256);
        context.wait_idle().unwrap();
    }

    #[test]
    fn queue_count_is_capped() {
        let device = Arc::new(HeadlessDevice::new(HeadlessConfig::default()));
        let context = GpuContextBuilder::new()
            .max_queues_per_family(1)
            .command_pool_mode(CommandPoolMode::Sequential)
            .build_headless(device.clone())
            .unwrap();

        assert_eq!(context.queues().records().count(), 2);
        assert_eq!(device.stats().command_pools, 1);
        drop(context);
        assert_eq!(device.stats().command_pools, 0);
    }
}
