//! Device context and native memory primitives.
//!
//! A [`Backend`] is everything the memory managers consume from the compute
//! API: device enumeration and selection, the active device's command queue,
//! and raw buffer creation, release, map and unmap.
//!
//! [`HostBackend`] implements it over host memory so that the managers can be
//! exercised without a GPU. Each emulated device has a fixed capacity and its
//! own [`HostQueue`].

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use snafu::ensure;

use crate::buffer::BufferPtr;
use crate::error::{DeviceSnafu, InvalidDeviceSnafu, InvalidSizeSnafu, Result};
use crate::queue::{CommandQueue, HostQueue};

/// Default capacity of an emulated device.
pub const DEFAULT_HOST_DEVICE_MEMORY: usize = 8 << 30;

/// Options for native buffer creation.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// Allocate memory that can be mapped into the host address space.
    pub host_visible: bool,
}

pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn device_count(&self) -> usize;

    fn active_device_id(&self) -> usize;

    fn set_active_device(&self, device: usize) -> Result<()>;

    /// Total memory reported by the device, in bytes.
    fn device_memory_size(&self, device: usize) -> usize;

    /// Command queue of the active device.
    fn queue(&self) -> Arc<dyn CommandQueue>;

    /// Create a native buffer on the active device and return its handle.
    fn create_buffer(&self, bytes: usize, options: &BufferOptions) -> Result<BufferPtr>;

    fn release_buffer(&self, handle: BufferPtr) -> Result<()>;

    /// Map a host-visible buffer into host memory. Blocks until the mapping is usable.
    fn map_buffer(&self, handle: BufferPtr, bytes: usize) -> Result<BufferPtr>;

    fn unmap_buffer(&self, handle: BufferPtr, mapped: BufferPtr) -> Result<()>;
}

#[derive(Debug)]
struct HostAllocation {
    data: Box<[u8]>,
    host_visible: bool,
    mapped: Option<BufferPtr>,
}

#[derive(Debug, Default)]
struct HostDevice {
    capacity: usize,
    used: usize,
    allocations: HashMap<BufferPtr, HostAllocation>,
    // Injected failures for the next `create_buffer` calls.
    failures: usize,
}

/// Host-memory emulation of a multi-device compute API.
pub struct HostBackend {
    devices: Vec<Mutex<HostDevice>>,
    queues: Vec<Arc<HostQueue>>,
    active: AtomicUsize,
    next_handle: AtomicUsize,
    created: AtomicUsize,
}

impl fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBackend")
            .field("devices", &self.devices.len())
            .field("active", &self.active_device_id())
            .finish()
    }
}

impl HostBackend {
    /// One emulated device per entry, with the given capacity in bytes.
    pub fn new(capacities: impl IntoIterator<Item = usize>) -> Self {
        let devices: Vec<_> =
            capacities.into_iter().map(|capacity| Mutex::new(HostDevice { capacity, ..Default::default() })).collect();
        // A backend without devices still answers `queue()`; its buffer calls fail.
        let queues = (0..devices.len().max(1)).map(|n| Arc::new(HostQueue::new(n))).collect();
        Self {
            devices,
            queues,
            active: AtomicUsize::new(0),
            next_handle: AtomicUsize::new(1),
            created: AtomicUsize::new(0),
        }
    }

    pub fn single(capacity: usize) -> Self {
        Self::new([capacity])
    }

    /// Build from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `MOROK_HOST_DEVICES` - Number of emulated devices (default: 1)
    /// * `MOROK_HOST_DEVICE_MEMORY` - Capacity of each device in bytes (default: 8 GiB)
    pub fn from_env() -> Self {
        let count = std::env::var("MOROK_HOST_DEVICES").ok().and_then(|s| s.parse().ok()).unwrap_or(1usize).max(1);
        let capacity = std::env::var("MOROK_HOST_DEVICE_MEMORY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HOST_DEVICE_MEMORY);
        Self::new(std::iter::repeat_n(capacity, count))
    }

    /// Typed access to a device queue, for driving outstanding work.
    pub fn host_queue(&self, device: usize) -> Option<&Arc<HostQueue>> {
        self.queues.get(device)
    }

    /// Make the next `count` buffer creations on `device` fail.
    pub fn fail_next_allocations(&self, device: usize, count: usize) {
        if let Some(dev) = self.devices.get(device) {
            dev.lock().failures = count;
        }
    }

    /// Native buffers currently alive on `device`.
    pub fn live_buffers(&self, device: usize) -> usize {
        self.devices.get(device).map_or(0, |dev| dev.lock().allocations.len())
    }

    pub fn used_bytes(&self, device: usize) -> usize {
        self.devices.get(device).map_or(0, |dev| dev.lock().used)
    }

    /// Successful native buffer creations over the backend's lifetime.
    pub fn buffers_created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    fn device(&self, device: usize) -> Result<&Mutex<HostDevice>> {
        self.devices.get(device).ok_or_else(|| InvalidDeviceSnafu { device, count: self.devices.len() }.build())
    }

    fn active(&self) -> Result<&Mutex<HostDevice>> {
        self.device(self.active_device_id())
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "HOST"
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn active_device_id(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn set_active_device(&self, device: usize) -> Result<()> {
        self.device(device)?;
        self.active.store(device, Ordering::Release);
        Ok(())
    }

    fn device_memory_size(&self, device: usize) -> usize {
        self.devices.get(device).map_or(0, |dev| dev.lock().capacity)
    }

    fn queue(&self) -> Arc<dyn CommandQueue> {
        let device = self.active_device_id().min(self.queues.len() - 1);
        self.queues[device].clone()
    }

    fn create_buffer(&self, bytes: usize, options: &BufferOptions) -> Result<BufferPtr> {
        ensure!(bytes > 0, InvalidSizeSnafu { bytes });

        let mut dev = self.active()?.lock();
        if dev.failures > 0 {
            dev.failures -= 1;
            return DeviceSnafu { message: format!("injected allocation failure ({bytes} bytes)") }.fail();
        }
        ensure!(
            dev.used.saturating_add(bytes) <= dev.capacity,
            DeviceSnafu {
                message: format!("out of device memory: {bytes} bytes requested, {} of {} in use", dev.used, dev.capacity)
            }
        );

        let id = self.next_handle.fetch_add(1, Ordering::AcqRel);
        let handle = BufferPtr::new(id << 4).ok_or_else(|| DeviceSnafu { message: "handle space exhausted" }.build())?;
        let data = vec![0u8; bytes].into_boxed_slice();
        dev.allocations.insert(handle, HostAllocation { data, host_visible: options.host_visible, mapped: None });
        dev.used += bytes;
        self.created.fetch_add(1, Ordering::AcqRel);
        Ok(handle)
    }

    fn release_buffer(&self, handle: BufferPtr) -> Result<()> {
        let mut dev = self.active()?.lock();
        let allocation = dev
            .allocations
            .remove(&handle)
            .ok_or_else(|| DeviceSnafu { message: format!("release of unknown buffer {handle}") }.build())?;
        dev.used -= allocation.data.len();
        Ok(())
    }

    fn map_buffer(&self, handle: BufferPtr, bytes: usize) -> Result<BufferPtr> {
        let mut dev = self.active()?.lock();
        let allocation = dev
            .allocations
            .get_mut(&handle)
            .ok_or_else(|| DeviceSnafu { message: format!("map of unknown buffer {handle}") }.build())?;
        ensure!(allocation.host_visible, DeviceSnafu { message: format!("buffer {handle} is not host visible") });
        ensure!(
            bytes <= allocation.data.len(),
            DeviceSnafu { message: format!("map of {bytes} bytes exceeds buffer {handle}") }
        );

        // Host memory is always coherent, so the mapping is usable right away.
        let mapped = BufferPtr::from(NonNull::from(&mut allocation.data[0]));
        allocation.mapped = Some(mapped);
        Ok(mapped)
    }

    fn unmap_buffer(&self, handle: BufferPtr, mapped: BufferPtr) -> Result<()> {
        let mut dev = self.active()?.lock();
        let allocation = dev
            .allocations
            .get_mut(&handle)
            .ok_or_else(|| DeviceSnafu { message: format!("unmap of unknown buffer {handle}") }.build())?;
        ensure!(
            allocation.mapped == Some(mapped),
            DeviceSnafu { message: format!("{mapped} is not a mapping of buffer {handle}") }
        );
        allocation.mapped = None;
        Ok(())
    }
}
