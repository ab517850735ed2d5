use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Backend, BufferOptions};
use crate::buffer::BufferPtr;
use crate::error::Result;

/// Native allocation primitives a [`crate::MemoryManager`] caches on top of.
pub trait NativeAllocator: Send + Sync + fmt::Debug {
    /// Allocate `bytes` on the active device, bypassing any cache.
    fn native_alloc(&self, bytes: usize) -> Result<BufferPtr>;

    /// Return a buffer obtained from [`NativeAllocator::native_alloc`] on the active device.
    fn native_free(&self, ptr: BufferPtr) -> Result<()>;

    fn active_device_id(&self) -> usize;

    fn set_active_device(&self, device: usize) -> Result<()>;

    fn device_count(&self) -> usize;

    /// Memory reported by `device`, in bytes. Zero when unknown.
    fn max_memory_size(&self, device: usize) -> usize;

    /// Drop any per-device bookkeeping during manager teardown.
    fn teardown_device(&self, _device: usize) {}

    fn name(&self) -> &str;
}

/// Plain device-resident buffers.
#[derive(Debug, Clone)]
pub struct DeviceAllocator {
    backend: Arc<dyn Backend>,
}

impl DeviceAllocator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

impl NativeAllocator for DeviceAllocator {
    fn native_alloc(&self, bytes: usize) -> Result<BufferPtr> {
        let ptr = self.backend.create_buffer(bytes, &BufferOptions::default())?;
        tracing::trace!(bytes, buffer.ptr = %ptr, "native_alloc");
        Ok(ptr)
    }

    fn native_free(&self, ptr: BufferPtr) -> Result<()> {
        tracing::trace!(buffer.ptr = %ptr, "native_free");
        self.backend.release_buffer(ptr)
    }

    fn active_device_id(&self) -> usize {
        self.backend.active_device_id()
    }

    fn set_active_device(&self, device: usize) -> Result<()> {
        self.backend.set_active_device(device)
    }

    fn device_count(&self) -> usize {
        self.backend.device_count()
    }

    fn max_memory_size(&self, device: usize) -> usize {
        self.backend.device_memory_size(device)
    }

    fn name(&self) -> &str {
        self.backend.name()
    }
}

/// Host-visible device buffers mapped into the host address space.
///
/// The buffer identity handed to the cache is the mapped host address. Each
/// device keeps a table from that address back to the native handle, needed
/// to unmap and release it.
pub struct PinnedAllocator {
    backend: Arc<dyn Backend>,
    pinned: Mutex<Vec<HashMap<BufferPtr, BufferPtr>>>,
    name: String,
}

impl fmt::Debug for PinnedAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked: Vec<usize> = self.pinned.lock().iter().map(HashMap::len).collect();
        f.debug_struct("PinnedAllocator").field("backend", &self.backend).field("tracked", &tracked).finish()
    }
}

impl PinnedAllocator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let pinned = Mutex::new(vec![HashMap::new(); backend.device_count()]);
        let name = format!("{}:PINNED", backend.name());
        Self { backend, pinned, name }
    }

    /// Native handle behind a mapped pointer on `device`.
    pub fn native_handle(&self, device: usize, ptr: BufferPtr) -> Option<BufferPtr> {
        self.pinned.lock().get(device).and_then(|map| map.get(&ptr).copied())
    }

    /// Number of mapped buffers tracked for `device`.
    pub fn tracked(&self, device: usize) -> usize {
        self.pinned.lock().get(device).map_or(0, HashMap::len)
    }
}

impl NativeAllocator for PinnedAllocator {
    fn native_alloc(&self, bytes: usize) -> Result<BufferPtr> {
        let handle = self.backend.create_buffer(bytes, &BufferOptions { host_visible: true })?;
        let ptr = match self.backend.map_buffer(handle, bytes) {
            Ok(ptr) => ptr,
            Err(err) => {
                if let Err(release) = self.backend.release_buffer(handle) {
                    tracing::warn!(buffer.handle = %handle, error = %release, "failed to release unmappable buffer");
                }
                return Err(err);
            }
        };
        tracing::trace!(bytes, buffer.ptr = %ptr, buffer.handle = %handle, "pinned native_alloc");

        let device = self.backend.active_device_id();
        let mut pinned = self.pinned.lock();
        if pinned.len() <= device {
            pinned.resize_with(device + 1, HashMap::new);
        }
        pinned[device].insert(ptr, handle);
        Ok(ptr)
    }

    fn native_free(&self, ptr: BufferPtr) -> Result<()> {
        tracing::trace!(buffer.ptr = %ptr, "pinned native_free");
        let device = self.backend.active_device_id();
        let Some(handle) = self.native_handle(device, ptr) else {
            return Ok(());
        };
        self.backend.unmap_buffer(handle, ptr)?;
        self.backend.release_buffer(handle)?;
        if let Some(map) = self.pinned.lock().get_mut(device) {
            map.remove(&ptr);
        }
        Ok(())
    }

    fn active_device_id(&self) -> usize {
        self.backend.active_device_id()
    }

    fn set_active_device(&self, device: usize) -> Result<()> {
        self.backend.set_active_device(device)
    }

    fn device_count(&self) -> usize {
        self.backend.device_count()
    }

    fn max_memory_size(&self, device: usize) -> usize {
        self.backend.device_memory_size(device)
    }

    fn teardown_device(&self, device: usize) {
        if let Some(map) = self.pinned.lock().get_mut(device) {
            map.clear();
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
