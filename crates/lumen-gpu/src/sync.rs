//! Synchronization primitives.

use crate::error::{GpuError, Result};
use crate::raw::RawDevice;
use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Convert an optional timeout into the nanosecond value Vulkan expects.
///
/// `None` waits forever.
pub fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

struct FenceInner {
    raw: Arc<dyn RawDevice>,
    handle: vk::Fence,
    signaled: AtomicBool,
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        // SAFETY: the last clone is gone, so nothing can submit with this fence anymore.
        unsafe { self.raw.destroy_fence(self.handle) };
    }
}

/// A binary GPU-to-host fence.
///
/// Clones share the native fence and its cached status; the fence is destroyed
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// Create a fence.
    pub fn new(raw: &Arc<dyn RawDevice>, signaled: bool) -> Result<Self> {
        // SAFETY: the device outlives the fence through the Arc held below.
        let handle = unsafe { raw.create_fence(signaled)? };
        Ok(Self {
            inner: Arc::new(FenceInner {
                raw: Arc::clone(raw),
                handle,
                signaled: AtomicBool::new(signaled),
            }),
        })
    }

    /// Get the raw fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.inner.handle
    }

    /// Block until the fence is signaled or `timeout` elapses.
    ///
    /// `None` waits forever. A timeout is reported as [`GpuError::FenceTimeout`]
    /// and a lost device as [`GpuError::DeviceLost`].
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.inner.signaled.load(Ordering::Acquire) {
            return Ok(());
        }

        // SAFETY: the handle is alive for as long as `self`.
        unsafe {
            self.inner
                .raw
                .wait_for_fence(self.inner.handle, timeout_ns(timeout))
                .map_err(GpuError::from_wait)?;
        }
        self.inner.signaled.store(true, Ordering::Release);
        Ok(())
    }

    /// Reset the fence to the unsignaled state.
    pub fn reset(&self) -> Result<()> {
        // SAFETY: callers only reset fences that are not pending.
        unsafe { self.inner.raw.reset_fence(self.inner.handle)? };
        self.inner.signaled.store(false, Ordering::Release);
        Ok(())
    }

    /// Whether the fence is signaled, querying the device if the cached status is stale.
    pub fn is_signaled(&self) -> Result<bool> {
        if self.inner.signaled.load(Ordering::Acquire) {
            return Ok(true);
        }
        // SAFETY: the handle is alive for as long as `self`.
        let signaled = unsafe { self.inner.raw.fence_status(self.inner.handle)? };
        if signaled {
            self.inner.signaled.store(true, Ordering::Release);
        }
        Ok(signaled)
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.inner.handle)
            .field("signaled", &self.inner.signaled.load(Ordering::Relaxed))
            .finish()
    }
}
