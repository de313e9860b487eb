//! Command buffer management.
//!
//! A [`CommandPool`] either serializes every access behind one mutex
//! ([`CommandPoolMode::Sequential`]) or gives each calling thread its own
//! native pool ([`CommandPoolMode::Concurrent`]). In concurrent mode the pool
//! remembers which sub-pool issued each command buffer, so buffers can be
//! recorded and freed from any thread.

use crate::error::Result;
use crate::raw::RawDevice;
use ash::vk;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// How a [`CommandPool`] hands out command buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandPoolMode {
    /// One native pool guarded by a single mutex.
    Sequential,
    /// One native pool per calling thread, created on first use.
    #[default]
    Concurrent,
}

/// A native pool together with the lock that provides Vulkan's external
/// synchronization for it.
struct SubPool {
    handle: vk::CommandPool,
    lock: Mutex<()>,
}

enum Pools {
    Sequential(SubPool),
    Concurrent {
        per_thread: RwLock<HashMap<ThreadId, Arc<SubPool>>>,
        issued: Mutex<HashMap<vk::CommandBuffer, Arc<SubPool>>>,
    },
}

/// Command pool for allocating command buffers.
pub struct CommandPool {
    raw: Arc<dyn RawDevice>,
    queue_family: u32,
    flags: vk::CommandPoolCreateFlags,
    pools: Pools,
}

impl CommandPool {
    /// Create a new command pool for `queue_family`.
    ///
    /// Sequential pools create their native pool immediately; concurrent pools
    /// create one lazily per thread.
    pub fn new(
        raw: Arc<dyn RawDevice>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
        mode: CommandPoolMode,
    ) -> Result<Self> {
        let pools = match mode {
            CommandPoolMode::Sequential => {
                // SAFETY: the family is validated by the context that owns the device.
                let handle = unsafe { raw.create_command_pool(queue_family, flags)? };
                Pools::Sequential(SubPool {
                    handle,
                    lock: Mutex::new(()),
                })
            }
            CommandPoolMode::Concurrent => Pools::Concurrent {
                per_thread: RwLock::new(HashMap::new()),
                issued: Mutex::new(HashMap::new()),
            },
        };

        Ok(Self {
            raw,
            queue_family,
            flags,
            pools,
        })
    }

    /// Get the access mode.
    pub fn mode(&self) -> CommandPoolMode {
        match self.pools {
            Pools::Sequential(_) => CommandPoolMode::Sequential,
            Pools::Concurrent { .. } => CommandPoolMode::Concurrent,
        }
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Number of native pools created so far.
    pub fn native_pool_count(&self) -> usize {
        match &self.pools {
            Pools::Sequential(_) => 1,
            Pools::Concurrent { per_thread, .. } => per_thread.read().len(),
        }
    }

    /// Allocate `count` command buffers.
    pub fn allocate_command_buffers(
        &self,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        match &self.pools {
            Pools::Sequential(pool) => {
                let _guard = pool.lock.lock();
                // SAFETY: the pool lock is held.
                unsafe { self.raw.allocate_command_buffers(pool.handle, level, count) }
            }
            Pools::Concurrent { per_thread, issued } => {
                let pool = self.thread_pool(per_thread)?;
                let buffers = {
                    let _guard = pool.lock.lock();
                    // SAFETY: the sub-pool lock is held.
                    unsafe { self.raw.allocate_command_buffers(pool.handle, level, count)? }
                };
                let mut issued = issued.lock();
                for &cmd in &buffers {
                    issued.insert(cmd, Arc::clone(&pool));
                }
                Ok(buffers)
            }
        }
    }

    /// Return command buffers to the pool that issued them.
    ///
    /// # Panics
    /// In concurrent mode, if a buffer was not allocated from this pool.
    pub fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        match &self.pools {
            Pools::Sequential(pool) => {
                let _guard = pool.lock.lock();
                // SAFETY: the pool lock is held and callers no longer use the buffers.
                unsafe { self.raw.free_command_buffers(pool.handle, buffers) };
            }
            Pools::Concurrent { issued, .. } => {
                let owners: Vec<Arc<SubPool>> = {
                    let mut issued = issued.lock();
                    buffers
                        .iter()
                        .map(|cmd| {
                            issued.remove(cmd).unwrap_or_else(|| {
                                panic!("command buffer {cmd:?} was not allocated from this pool")
                            })
                        })
                        .collect()
                };
                for (cmd, pool) in buffers.iter().zip(owners) {
                    let _guard = pool.lock.lock();
                    // SAFETY: the owning sub-pool lock is held.
                    unsafe { self.raw.free_command_buffers(pool.handle, std::slice::from_ref(cmd)) };
                }
            }
        }
    }

    /// Record `cmd` from start to end while the pool that issued it is locked.
    ///
    /// `f` receives the device to issue `cmd_*` calls on.
    pub fn record<R>(
        &self,
        cmd: vk::CommandBuffer,
        flags: vk::CommandBufferUsageFlags,
        f: impl FnOnce(&dyn RawDevice, vk::CommandBuffer) -> R,
    ) -> Result<R> {
        self.with_owner_locked(cmd, || {
            // SAFETY: the pool that issued `cmd` is locked for the whole recording.
            unsafe {
                self.raw.begin_command_buffer(cmd, flags)?;
                let out = f(self.raw.as_ref(), cmd);
                self.raw.end_command_buffer(cmd)?;
                Ok(out)
            }
        })
    }

    fn with_owner_locked<R>(&self, cmd: vk::CommandBuffer, f: impl FnOnce() -> R) -> R {
        match &self.pools {
            Pools::Sequential(pool) => {
                let _guard = pool.lock.lock();
                f()
            }
            Pools::Concurrent { issued, .. } => {
                let owner = issued.lock().get(&cmd).cloned().unwrap_or_else(|| {
                    panic!("command buffer {cmd:?} was not allocated from this pool")
                });
                let _guard = owner.lock.lock();
                f()
            }
        }
    }

    fn thread_pool(
        &self,
        per_thread: &RwLock<HashMap<ThreadId, Arc<SubPool>>>,
    ) -> Result<Arc<SubPool>> {
        let id = thread::current().id();
        if let Some(pool) = per_thread.read().get(&id) {
            return Ok(Arc::clone(pool));
        }

        // Only this thread inserts under its own id, so the miss above cannot race.
        // SAFETY: a fresh pool is not yet visible to any other thread.
        let handle = unsafe { self.raw.create_command_pool(self.queue_family, self.flags)? };
        let pool = Arc::new(SubPool {
            handle,
            lock: Mutex::new(()),
        });
        per_thread.write().insert(id, Arc::clone(&pool));
        tracing::trace!(?id, family = self.queue_family, "created per-thread command pool");
        Ok(pool)
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        match &mut self.pools {
            Pools::Sequential(pool) => {
                // SAFETY: `&mut self` means no recording is in progress.
                unsafe { self.raw.destroy_command_pool(pool.handle) };
            }
            Pools::Concurrent { per_thread, .. } => {
                for (_, pool) in per_thread.get_mut().drain() {
                    // SAFETY: `&mut self` means no recording is in progress.
                    unsafe { self.raw.destroy_command_pool(pool.handle) };
                }
            }
        }
    }
}
