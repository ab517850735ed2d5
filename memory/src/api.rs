//! Process-wide allocation functions.
//!
//! Thin wrappers over the managers in [`crate::registry::registry`]. Every
//! allocation makes the active queue wait for the previous user of the
//! memory, and every free attaches a snapshot of the work issued so far.

use snafu::OptionExt;

use crate::buffer::{BufferPtr, DeviceBuffer};
use crate::error::{Result, SizeOverflowSnafu};
use crate::manager::BufferInfo;
use crate::registry::registry;

fn bytes_for<T>(count: usize) -> Result<usize> {
    let elem_size = std::mem::size_of::<T>();
    count.checked_mul(elem_size).context(SizeOverflowSnafu { count, elem_size })
}

/// Allocate `count` elements of `T` in device memory, released on drop.
pub fn mem_alloc<T>(count: usize) -> Result<DeviceBuffer<T>> {
    let bytes = bytes_for::<T>(count)?;
    let registry = registry();
    let ptr = registry.alloc(bytes, false)?;
    Ok(DeviceBuffer::new(ptr, count, registry))
}

/// Allocate device memory owned by application code. Free with [`free_user`].
pub fn alloc_user(bytes: usize) -> Result<BufferPtr> {
    registry().alloc(bytes, true)
}

/// Allocate an internal device buffer. Free with [`free_buffer`].
pub fn alloc_buffer(bytes: usize) -> Result<BufferPtr> {
    registry().alloc(bytes, false)
}

pub fn free_buffer(ptr: BufferPtr) -> Result<()> {
    registry().free_buffer(ptr)
}

pub fn free_user(ptr: BufferPtr) -> Result<()> {
    registry().free_user(ptr)
}

/// Allocate `count` elements of `T` in pinned host memory.
///
/// The returned pointer is a host address; use [`BufferPtr::as_ptr`] to access it.
pub fn pinned_alloc<T>(count: usize) -> Result<BufferPtr> {
    registry().pinned_alloc(bytes_for::<T>(count)?)
}

pub fn pinned_free(ptr: BufferPtr) -> Result<()> {
    registry().pinned_free(ptr)
}

/// Keep `ptr` alive across the release of its allocation.
pub fn lock(ptr: BufferPtr) -> Result<()> {
    registry().device_manager().user_lock(ptr)
}

pub fn unlock(ptr: BufferPtr) -> Result<()> {
    registry().device_manager().user_unlock(ptr)
}

pub fn is_locked(ptr: BufferPtr) -> bool {
    registry().device_manager().is_user_locked(ptr)
}

/// Device memory counters for the active device.
pub fn device_memory_info() -> Result<BufferInfo> {
    registry().device_manager().buffer_info()
}

pub fn set_step_size(bytes: usize) {
    registry().device_manager().set_step_size(bytes);
}

pub fn step_size() -> usize {
    registry().device_manager().step_size()
}

pub fn max_bytes() -> usize {
    registry().device_manager().max_bytes()
}

pub fn max_buffers() -> usize {
    registry().device_manager().max_buffers()
}

pub fn garbage_collect() -> Result<()> {
    registry().device_manager().garbage_collect()
}

pub fn print_info(label: &str, device: usize) -> Result<()> {
    registry().device_manager().print_info(label, device)
}

/// Whether the active device is at its memory limit and callers should
/// synchronize or collect before issuing more work.
pub fn check_memory_limit() -> bool {
    registry().device_manager().check_memory_limit()
}
