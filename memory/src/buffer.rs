use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::registry::MemoryRegistry;

/// Identity of a buffer handed out by a memory manager.
///
/// For device memory this is the native handle, for pinned memory the mapped
/// host address. The manager never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferPtr(NonZeroUsize);

impl BufferPtr {
    /// Wrap a raw address. Returns `None` for null.
    pub fn new(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    pub fn addr(self) -> usize {
        self.0.get()
    }

    /// Reinterpret as a typed raw pointer.
    ///
    /// Only meaningful for pinned allocations, whose identity is a host address.
    pub fn as_ptr<T>(self) -> *mut T {
        self.0.get() as *mut T
    }
}

impl<T> From<NonNull<T>> for BufferPtr {
    fn from(ptr: NonNull<T>) -> Self {
        Self(ptr.addr())
    }
}

impl fmt::Display for BufferPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Typed device allocation that goes back to the cache when dropped.
///
/// The release attaches a snapshot of the active queue's outstanding work,
/// so a later owner of the same memory waits for everything issued before the drop.
pub struct DeviceBuffer<T> {
    ptr: BufferPtr,
    len: usize,
    registry: Arc<MemoryRegistry>,
    _elem: PhantomData<T>,
}

impl<T> DeviceBuffer<T> {
    pub(crate) fn new(ptr: BufferPtr, len: usize, registry: Arc<MemoryRegistry>) -> Self {
        Self { ptr, len, registry, _elem: PhantomData }
    }

    pub fn ptr(&self) -> BufferPtr {
        self.ptr
    }

    /// Number of `T` elements requested.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Requested size in bytes (the cached bucket may be larger).
    pub fn bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Give up automatic release. The caller must pass the pointer to
    /// [`crate::api::free_buffer`] eventually.
    pub fn into_raw(self) -> BufferPtr {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl<T> fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("elem", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if let Err(err) = self.registry.free_buffer(self.ptr) {
            tracing::warn!(buffer.ptr = %self.ptr, error = %err, "failed to release device buffer");
        }
    }
}
