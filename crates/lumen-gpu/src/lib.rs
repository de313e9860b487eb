//! GPU memory layer for the Lumen engine.
//!
//! This crate provides:
//! - Vulkan device and queue setup, plus a headless software device
//! - Host and staging/device buffer allocators
//! - Owning buffer handles and typed views (array, vector, tuple)
//! - Round-robin queue submission and per-thread command pools
//! - Fences and staging uploads

pub mod allocator;
pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod device_allocator;
pub mod error;
pub mod headless;
pub mod host_allocator;
pub mod instance;
pub mod queue;
pub mod raw;
pub mod staging;
pub mod sync;
pub mod tuple;
pub mod view;
pub mod vulkan;

pub use allocator::{align_size, Allocator, AllocatorKind, BufferInfo};
pub use buffer::Buffer;
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{CommandPool, CommandPoolMode};
pub use context::{GpuContext, GpuContextBuilder};
pub use device_allocator::DeviceAllocator;
pub use error::{GpuError, Result};
pub use headless::{HeadlessConfig, HeadlessDevice, HeadlessStats, QueueFamilyConfig};
pub use host_allocator::HostAllocator;
pub use queue::{QueueContainer, QueueLevel, QueueRecord};
pub use raw::{Backend, BoundMemory, MappedPtr, RawDevice, Submission};
pub use staging::{upload, StagingBuffer};
pub use sync::Fence;
pub use tuple::{Field, Fields, Tuple};
pub use view::{Array, Vector};
pub use vulkan::VulkanDevice;
