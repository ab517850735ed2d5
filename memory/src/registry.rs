use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use snafu::ensure;

use crate::allocator::{DeviceAllocator, PinnedAllocator};
use crate::backend::{Backend, HostBackend};
use crate::buffer::BufferPtr;
use crate::config::MemoryConfig;
use crate::error::{AlreadyInstalledSnafu, Result};
use crate::manager::{Allocation, MemoryManager};

/// The device and pinned memory managers of one backend.
#[derive(Debug)]
pub struct MemoryRegistry {
    backend: Arc<dyn Backend>,
    device: MemoryManager,
    pinned: MemoryManager,
}

impl MemoryRegistry {
    pub fn new(backend: Arc<dyn Backend>, config: &MemoryConfig) -> Self {
        let device = MemoryManager::new(Box::new(DeviceAllocator::new(Arc::clone(&backend))), config);
        let pinned = MemoryManager::new(Box::new(PinnedAllocator::new(Arc::clone(&backend))), config);
        Self { backend, device, pinned }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn device_manager(&self) -> &MemoryManager {
        &self.device
    }

    pub fn pinned_manager(&self) -> &MemoryManager {
        &self.pinned
    }

    /// Allocate device memory and order the active queue after its previous use.
    pub fn alloc(&self, bytes: usize, user: bool) -> Result<BufferPtr> {
        Self::acquire(&*self.backend, &self.device, bytes, user)
    }

    /// Release the manager lock on a device buffer.
    pub fn free_buffer(&self, ptr: BufferPtr) -> Result<()> {
        let event = self.backend.queue().make_event()?;
        self.device.release(ptr, event, false)
    }

    /// Release a buffer obtained with `alloc(bytes, true)`.
    pub fn free_user(&self, ptr: BufferPtr) -> Result<()> {
        let event = self.backend.queue().make_event()?;
        self.device.release(ptr, event, true)
    }

    pub fn pinned_alloc(&self, bytes: usize) -> Result<BufferPtr> {
        Self::acquire(&*self.backend, &self.pinned, bytes, false)
    }

    pub fn pinned_free(&self, ptr: BufferPtr) -> Result<()> {
        let event = self.backend.queue().make_event()?;
        self.pinned.release(ptr, event, false)
    }

    /// Tear down both managers. Safe to call more than once.
    pub fn shutdown(&self) {
        self.device.shutdown();
        self.pinned.shutdown();
    }

    fn acquire(backend: &dyn Backend, manager: &MemoryManager, bytes: usize, user: bool) -> Result<BufferPtr> {
        let Allocation { ptr, event } = manager.allocate(bytes, user)?;
        let Some(event) = event else {
            return Ok(ptr);
        };
        match backend.queue().enqueue_wait(&event) {
            Ok(()) => Ok(ptr),
            Err(err) => {
                // Nothing was issued on the buffer; give it back with its original event.
                if let Err(release) = manager.release(ptr, event, user) {
                    tracing::warn!(buffer.ptr = %ptr, error = %release, "failed to return buffer after wait error");
                }
                Err(err)
            }
        }
    }
}

static REGISTRY: Lazy<RwLock<Option<Arc<MemoryRegistry>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide managers for `backend`.
///
/// Fails if managers are already installed. Call [`shutdown`] first to replace them.
pub fn install(backend: Arc<dyn Backend>, config: MemoryConfig) -> Result<Arc<MemoryRegistry>> {
    let mut slot = REGISTRY.write();
    ensure!(slot.is_none(), AlreadyInstalledSnafu);

    let registry = Arc::new(MemoryRegistry::new(backend, &config));
    *slot = Some(Arc::clone(&registry));
    Ok(registry)
}

/// Get the process-wide managers.
///
/// Installs a [`HostBackend`] configured from the environment on first use.
pub fn registry() -> Arc<MemoryRegistry> {
    // Fast path: read lock
    if let Some(registry) = REGISTRY.read().as_ref() {
        return Arc::clone(registry);
    }

    let mut slot = REGISTRY.write();
    if let Some(registry) = slot.as_ref() {
        return Arc::clone(registry);
    }

    let backend: Arc<dyn Backend> = Arc::new(HostBackend::from_env());
    tracing::debug!(backend = backend.name(), devices = backend.device_count(), "installing default memory managers");
    let registry = Arc::new(MemoryRegistry::new(backend, &MemoryConfig::from_env()));
    *slot = Some(Arc::clone(&registry));
    registry
}

/// Whether process-wide managers are currently installed.
pub fn is_installed() -> bool {
    REGISTRY.read().is_some()
}

/// Tear down the process-wide managers.
///
/// Returns `false` when nothing was installed. Buffers still held elsewhere
/// keep their registry alive but are no longer collected.
pub fn shutdown() -> bool {
    let Some(registry) = REGISTRY.write().take() else {
        return false;
    };
    registry.shutdown();
    true
}
