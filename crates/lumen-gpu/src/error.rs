//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A buffer of zero bytes was requested.
    #[error("Zero-sized allocations are not supported")]
    ZeroSizedAllocation,

    /// A fence wait ran out of time.
    #[error("Fence wait timed out")]
    FenceTimeout,

    /// The device was lost while waiting on the GPU.
    #[error("Device lost")]
    DeviceLost,

    /// No registered queue supports the requested capability.
    #[error("No queue supports {0:?}")]
    NoQueueSupportsFlag(vk::QueueFlags),

    /// An earlier upload of the allocation did not finish in time and is
    /// still running.
    #[error("A previous upload of this allocation has not completed")]
    UploadPending,

    /// The staging half of a device allocation was already released.
    #[error("Staging memory of this allocation was released")]
    StagingReleased,

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Translate the result code of a fence wait.
    pub fn from_wait(result: vk::Result) -> Self {
        match result {
            vk::Result::TIMEOUT => Self::FenceTimeout,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Vulkan(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for GpuError {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        Self::AllocationFailed(err.to_string())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_results_are_translated() {
        assert!(matches!(
            GpuError::from_wait(vk::Result::TIMEOUT),
            GpuError::FenceTimeout
        ));
        assert!(matches!(
            GpuError::from_wait(vk::Result::ERROR_DEVICE_LOST),
            GpuError::DeviceLost
        ));
        assert!(matches!(
            GpuError::from_wait(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
    }
}
