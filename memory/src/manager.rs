//! Size-bucketed caching memory manager.
//!
//! Native device allocations are slow and synchronize with the device, so
//! released buffers are parked in a per-device free list keyed by their
//! rounded size and handed out again on the next request of the same size.
//!
//! # Asynchronous safety
//!
//! Every buffer enters the free list together with an [`Event`] describing the
//! device work issued before its release. A cache hit returns that event to
//! the new owner, who must make its queue wait on it before touching the
//! memory. Garbage collection blocks on the event before the native free.
//!
//! # Locking
//!
//! A buffer in the locked set carries two independent flags: the manager lock
//! taken by [`MemoryManager::allocate`] and the user lock taken by
//! [`MemoryManager::user_lock`] (or by a user allocation). It only moves to the
//! free list once both are cleared.
//!
//! # Thread Safety
//!
//! All bookkeeping sits behind one `parking_lot::Mutex` per manager. Native
//! allocation and collection run while holding it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use snafu::{OptionExt, ensure};

use crate::allocator::NativeAllocator;
use crate::buffer::BufferPtr;
use crate::config::MemoryConfig;
use crate::error::{Error, InvalidDeviceSnafu, InvalidSizeSnafu, OutOfMemorySnafu, Result, UnknownBufferSnafu};
use crate::sync::Event;

/// A buffer handed out by [`MemoryManager::allocate`].
#[derive(Debug)]
pub struct Allocation {
    pub ptr: BufferPtr,
    /// Work a previous owner issued on this memory. Must be waited on before new work.
    pub event: Option<Event>,
}

/// Allocation counters for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferInfo {
    /// Bytes held by the manager, free and locked.
    pub alloc_bytes: usize,
    pub alloc_buffers: usize,
    /// Bytes currently locked by the manager or the user.
    pub lock_bytes: usize,
    pub lock_buffers: usize,
}

#[derive(Debug)]
struct LockInfo {
    manager_lock: bool,
    user_lock: bool,
    bytes: usize,
    /// Release event that arrived while the user lock was still held.
    pending: Option<Event>,
}

#[derive(Debug)]
struct FreeBuffer {
    ptr: BufferPtr,
    event: Option<Event>,
}

#[derive(Debug, Default)]
struct DevicePartition {
    free: HashMap<usize, Vec<FreeBuffer>>,
    locked: HashMap<BufferPtr, LockInfo>,
    total_bytes: usize,
    total_buffers: usize,
    lock_bytes: usize,
    lock_buffers: usize,
    max_bytes: usize,
}

impl DevicePartition {
    fn info(&self) -> BufferInfo {
        BufferInfo {
            alloc_bytes: self.total_bytes,
            alloc_buffers: self.total_buffers,
            lock_bytes: self.lock_bytes,
            lock_buffers: self.lock_buffers,
        }
    }

    /// Most recently freed buffer of exactly `bytes`.
    fn take_free(&mut self, bytes: usize) -> Option<FreeBuffer> {
        let bucket = self.free.get_mut(&bytes)?;
        let buffer = bucket.pop();
        if bucket.is_empty() {
            self.free.remove(&bytes);
        }
        buffer
    }

    /// Remove `ptr` from whichever bucket holds it.
    fn take_free_ptr(&mut self, ptr: BufferPtr) -> Option<(usize, FreeBuffer)> {
        let (bytes, index) = self
            .free
            .iter()
            .find_map(|(&bytes, bucket)| bucket.iter().position(|b| b.ptr == ptr).map(|index| (bytes, index)))?;
        let bucket = self.free.get_mut(&bytes)?;
        let buffer = bucket.remove(index);
        if bucket.is_empty() {
            self.free.remove(&bytes);
        }
        Some((bytes, buffer))
    }

    fn lock(&mut self, ptr: BufferPtr, bytes: usize, user: bool, pending: Option<Event>) {
        self.locked.insert(ptr, LockInfo { manager_lock: !user, user_lock: user, bytes, pending });
        self.lock_bytes += bytes;
        self.lock_buffers += 1;
    }

    fn cached_buffers(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }
}

#[derive(Debug)]
struct State {
    partitions: Vec<DevicePartition>,
    step_size: usize,
    max_buffers: usize,
    debug: bool,
}

impl State {
    fn partition(&self, device: usize) -> Result<&DevicePartition> {
        let count = self.partitions.len();
        self.partitions.get(device).context(InvalidDeviceSnafu { device, count })
    }

    fn partition_mut(&mut self, device: usize) -> Result<&mut DevicePartition> {
        let count = self.partitions.len();
        self.partitions.get_mut(device).context(InvalidDeviceSnafu { device, count })
    }

    /// Device whose locked set holds `ptr`.
    fn owner(&self, ptr: BufferPtr) -> Option<usize> {
        self.partitions.iter().position(|p| p.locked.contains_key(&ptr))
    }
}

/// Caching allocator over a [`NativeAllocator`], partitioned per device.
pub struct MemoryManager {
    native: Box<dyn NativeAllocator>,
    state: Mutex<State>,
    shut_down: AtomicBool,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager").field("native", &self.native).field("state", &*self.state.lock()).finish()
    }
}

impl MemoryManager {
    pub fn new(native: Box<dyn NativeAllocator>, config: &MemoryConfig) -> Self {
        let partitions = (0..native.device_count())
            .map(|n| DevicePartition { max_bytes: config.budget_for(native.max_memory_size(n)), ..Default::default() })
            .collect();
        let state =
            State { partitions, step_size: config.step_size.max(1), max_buffers: config.max_buffers, debug: config.debug };
        Self { native, state: Mutex::new(state), shut_down: AtomicBool::new(false) }
    }

    pub fn native(&self) -> &dyn NativeAllocator {
        &*self.native
    }

    pub fn name(&self) -> &str {
        self.native.name()
    }

    pub fn device_count(&self) -> usize {
        self.state.lock().partitions.len()
    }

    /// Allocate at least `bytes` on the active device.
    ///
    /// The request is rounded up to the step size. A cached buffer of the same
    /// rounded size is reused when available, and its release event is returned
    /// with it. Otherwise a native allocation is made, collecting the device's
    /// free list first when the budget or the buffer limit would be exceeded,
    /// and once more if the native allocation itself fails.
    pub fn allocate(&self, bytes: usize, user: bool) -> Result<Allocation> {
        ensure!(bytes > 0, InvalidSizeSnafu { bytes });

        let device = self.native.active_device_id();
        let mut state = self.state.lock();
        let alloc_bytes = bytes.div_ceil(state.step_size).checked_mul(state.step_size).context(InvalidSizeSnafu { bytes })?;
        let (debug, max_buffers) = (state.debug, state.max_buffers);

        let partition = state.partition_mut(device)?;
        if !debug && let Some(FreeBuffer { ptr, event }) = partition.take_free(alloc_bytes) {
            partition.lock(ptr, alloc_bytes, user, None);
            tracing::debug!(device, bytes = alloc_bytes, buffer.ptr = %ptr, "cache hit");
            return Ok(Allocation { ptr, event });
        }

        let over_limit = partition.total_bytes.saturating_add(alloc_bytes) > partition.max_bytes
            || partition.total_buffers >= max_buffers;
        if over_limit {
            self.collect(&mut state, device)?;
        }

        let partition = state.partition_mut(device)?;
        let max_bytes = partition.max_bytes;
        ensure!(
            partition.total_bytes.saturating_add(alloc_bytes) <= max_bytes,
            OutOfMemorySnafu { device, bytes: alloc_bytes, max_bytes }
        );

        let ptr = match self.native.native_alloc(alloc_bytes) {
            Ok(ptr) => ptr,
            Err(err) => {
                tracing::debug!(device, bytes = alloc_bytes, error = %err, "native allocation failed, collecting");
                self.collect(&mut state, device)?;
                self.native.native_alloc(alloc_bytes).map_err(|err| {
                    tracing::warn!(device, bytes = alloc_bytes, error = %err, "native allocation failed after collection");
                    OutOfMemorySnafu { device, bytes: alloc_bytes, max_bytes }.build()
                })?
            }
        };

        let partition = state.partition_mut(device)?;
        partition.total_bytes += alloc_bytes;
        partition.total_buffers += 1;
        partition.lock(ptr, alloc_bytes, user, None);
        Ok(Allocation { ptr, event: None })
    }

    /// Release the manager lock (`user == false`) or the user lock on `ptr`.
    ///
    /// Once neither lock is held the buffer joins its device's free list with
    /// `event` attached. Releasing a lock that is not held fails with
    /// [`Error::UnknownBuffer`]. After [`MemoryManager::shutdown`] the buffer
    /// is freed natively instead of cached. While the other lock is still held, `event` is kept
    /// and attached when that lock goes away.
    pub fn release(&self, ptr: BufferPtr, event: Event, user: bool) -> Result<()> {
        let mut state = self.state.lock();
        let device = state.owner(ptr).context(UnknownBufferSnafu { ptr })?;

        let partition = state.partition_mut(device)?;
        let Some(info) = partition.locked.get_mut(&ptr) else {
            return UnknownBufferSnafu { ptr }.fail();
        };
        let held = if user { &mut info.user_lock } else { &mut info.manager_lock };
        ensure!(*held, UnknownBufferSnafu { ptr });
        *held = false;
        if info.manager_lock || info.user_lock {
            info.pending = Some(event);
            return Ok(());
        }

        self.unlock_to_free(&mut state, device, ptr, Some(event))
    }

    /// Pin `ptr` so that releasing its allocation does not free it.
    ///
    /// No-op for buffers that are already user-locked. A buffer sitting in the
    /// free list is taken back into the locked set.
    pub fn user_lock(&self, ptr: BufferPtr) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(device) = state.owner(ptr) {
            if let Some(info) = state.partition_mut(device)?.locked.get_mut(&ptr) {
                info.user_lock = true;
            }
            return Ok(());
        }

        for partition in &mut state.partitions {
            if let Some((bytes, buffer)) = partition.take_free_ptr(ptr) {
                partition.lock(ptr, bytes, true, buffer.event);
                return Ok(());
            }
        }
        UnknownBufferSnafu { ptr }.fail()
    }

    /// Drop the user lock on `ptr`. No-op when `ptr` is not user-locked.
    pub fn user_unlock(&self, ptr: BufferPtr) -> Result<()> {
        let mut state = self.state.lock();
        let Some(device) = state.owner(ptr) else {
            return Ok(());
        };
        let Some(info) = state.partition_mut(device)?.locked.get_mut(&ptr) else {
            return Ok(());
        };
        if !info.user_lock {
            return Ok(());
        }
        info.user_lock = false;
        if info.manager_lock {
            return Ok(());
        }

        let pending = info.pending.take();
        self.unlock_to_free(&mut state, device, ptr, pending)
    }

    pub fn is_user_locked(&self, ptr: BufferPtr) -> bool {
        self.state.lock().partitions.iter().any(|p| p.locked.get(&ptr).is_some_and(|info| info.user_lock))
    }

    /// Natively free every cached buffer on every device.
    ///
    /// Locked buffers are untouched. Every device is collected even if one of
    /// them fails; the first error is returned.
    pub fn garbage_collect(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut first_err = None;
        for device in 0..state.partitions.len() {
            if state.partitions[device].free.is_empty() {
                continue;
            }
            if let Err(err) = self.on_device(device, || self.collect(&mut state, device)) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Natively free every cached buffer on `device`.
    pub fn garbage_collect_device(&self, device: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.partition(device)?;
        self.on_device(device, || self.collect(&mut state, device))
    }

    /// Set the rounding granularity for future allocations. Zero is treated as one.
    pub fn set_step_size(&self, bytes: usize) {
        self.state.lock().step_size = bytes.max(1);
    }

    pub fn step_size(&self) -> usize {
        self.state.lock().step_size
    }

    /// Byte budget of the active device.
    pub fn max_bytes(&self) -> usize {
        let device = self.native.active_device_id();
        self.state.lock().partition(device).map_or(0, |p| p.max_bytes)
    }

    pub fn max_buffers(&self) -> usize {
        self.state.lock().max_buffers
    }

    /// Counters for the active device.
    pub fn buffer_info(&self) -> Result<BufferInfo> {
        self.buffer_info_for(self.native.active_device_id())
    }

    pub fn buffer_info_for(&self, device: usize) -> Result<BufferInfo> {
        Ok(self.state.lock().partition(device)?.info())
    }

    /// Number of buffers parked in `device`'s free list.
    pub fn cached_buffers(&self, device: usize) -> usize {
        self.state.lock().partition(device).map_or(0, DevicePartition::cached_buffers)
    }

    /// Whether the active device has reached its byte budget or buffer limit.
    pub fn check_memory_limit(&self) -> bool {
        let device = self.native.active_device_id();
        let state = self.state.lock();
        state.partition(device).is_ok_and(|p| p.total_bytes >= p.max_bytes || p.total_buffers >= state.max_buffers)
    }

    /// Snapshot of every buffer held for `device`.
    pub fn memory_report(&self, label: &str, device: usize) -> Result<MemoryReport> {
        let state = self.state.lock();
        let partition = state.partition(device)?;

        let mut buffers: Vec<ReportRow> = partition
            .locked
            .iter()
            .map(|(&ptr, info)| ReportRow {
                ptr,
                bytes: info.bytes,
                manager_lock: info.manager_lock,
                user_lock: info.user_lock,
            })
            .chain(partition.free.iter().flat_map(|(&bytes, bucket)| {
                bucket.iter().map(move |b| ReportRow { ptr: b.ptr, bytes, manager_lock: false, user_lock: false })
            }))
            .collect();
        buffers.sort_by_key(|row| row.ptr);

        Ok(MemoryReport {
            label: label.to_string(),
            manager: self.native.name().to_string(),
            device,
            info: partition.info(),
            max_bytes: partition.max_bytes,
            step_size: state.step_size,
            buffers,
        })
    }

    /// Log a human-readable summary of `device` at info level.
    pub fn print_info(&self, label: &str, device: usize) -> Result<()> {
        let report = self.memory_report(label, device)?;
        tracing::info!(device, manager = %report.manager, "\n{report}");
        Ok(())
    }

    /// Collect every device and drop native bookkeeping.
    ///
    /// Errors are logged and skipped so that one failing device does not
    /// prevent cleanup of the others. Only the first call has an effect.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let previous = self.native.active_device_id();
        let mut state = self.state.lock();
        for device in 0..state.partitions.len() {
            match self.native.set_active_device(device) {
                Ok(()) => {
                    if let Err(err) = self.collect(&mut state, device) {
                        tracing::warn!(device, manager = self.native.name(), error = %err, "collection failed during shutdown");
                    }
                }
                Err(err) => {
                    tracing::warn!(device, manager = self.native.name(), error = %err, "device switch failed during shutdown");
                }
            }
            self.native.teardown_device(device);
        }
        if let Err(err) = self.native.set_active_device(previous) {
            tracing::warn!(device = previous, error = %err, "failed to restore active device after shutdown");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Move a fully unlocked buffer from the locked set to the free list, or
    /// free it natively when caching is off.
    fn unlock_to_free(&self, state: &mut State, device: usize, ptr: BufferPtr, event: Option<Event>) -> Result<()> {
        // Nothing collects the free lists after shutdown.
        let cache = !state.debug && !self.is_shut_down();
        let partition = state.partition_mut(device)?;
        let info = partition.locked.remove(&ptr).context(UnknownBufferSnafu { ptr })?;
        partition.lock_bytes -= info.bytes;
        partition.lock_buffers -= 1;

        if cache {
            partition.free.entry(info.bytes).or_default().push(FreeBuffer { ptr, event });
            return Ok(());
        }

        partition.total_bytes -= info.bytes;
        partition.total_buffers -= 1;
        if let Some(event) = &event {
            event.wait()?;
        }
        self.on_device(device, || self.native.native_free(ptr))
    }

    /// Free `device`'s whole free list. The active device must be `device`.
    fn collect(&self, state: &mut State, device: usize) -> Result<()> {
        let partition = state.partition_mut(device)?;
        let free = std::mem::take(&mut partition.free);

        let mut first_err: Option<Error> = None;
        let (mut freed, mut freed_bytes) = (0usize, 0usize);
        for (bytes, bucket) in free {
            for FreeBuffer { ptr, event } in bucket {
                if let Some(event) = event
                    && let Err(err) = event.wait()
                {
                    first_err.get_or_insert(err);
                }
                if let Err(err) = self.native.native_free(ptr) {
                    first_err.get_or_insert(err);
                }
                partition.total_bytes -= bytes;
                partition.total_buffers -= 1;
                freed += 1;
                freed_bytes += bytes;
            }
        }

        tracing::debug!(device, manager = self.native.name(), buffers = freed, bytes = freed_bytes, "garbage collection");
        first_err.map_or(Ok(()), Err)
    }

    /// Run `f` with `device` active, restoring the previous device afterwards.
    fn on_device<R>(&self, device: usize, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let previous = self.native.active_device_id();
        if previous == device {
            return f();
        }

        self.native.set_active_device(device)?;
        let result = f();
        if let Err(err) = self.native.set_active_device(previous) {
            tracing::warn!(device = previous, error = %err, "failed to restore active device");
        }
        result
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One buffer line of a [`MemoryReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub ptr: BufferPtr,
    pub bytes: usize,
    pub manager_lock: bool,
    pub user_lock: bool,
}

/// Human-readable state of one device partition.
#[derive(Debug, Clone)]
pub struct MemoryReport {
    pub label: String,
    pub manager: String,
    pub device: usize,
    pub info: BufferInfo,
    pub max_bytes: usize,
    pub step_size: usize,
    pub buffers: Vec<ReportRow>,
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yes_no = |b: bool| if b { "Yes" } else { "No" };

        writeln!(f, "{}", self.label)?;
        writeln!(f, "---------------------------------------------------------")?;
        writeln!(f, "|     POINTER      |    SIZE    |  MANAGER  |   USER   |")?;
        writeln!(f, "|                  |            |  LOCKED   |  LOCKED  |")?;
        writeln!(f, "---------------------------------------------------------")?;
        for row in &self.buffers {
            writeln!(
                f,
                "| {:>16} | {:>10} | {:>9} | {:>8} |",
                row.ptr.to_string(),
                bytes_to_string(row.bytes),
                yes_no(row.manager_lock),
                yes_no(row.user_lock)
            )?;
        }
        writeln!(f, "---------------------------------------------------------")?;
        writeln!(f, "Memory summary ({} device {})", self.manager, self.device)?;
        writeln!(f, "  allocated: {} in {} buffers", bytes_to_string(self.info.alloc_bytes), self.info.alloc_buffers)?;
        writeln!(f, "  locked:    {} in {} buffers", bytes_to_string(self.info.lock_bytes), self.info.lock_buffers)?;
        write!(f, "  budget:    {} (step {})", bytes_to_string(self.max_bytes), bytes_to_string(self.step_size))
    }
}

/// Format a byte count with a binary unit suffix, e.g. `1.50 KB`.
pub fn bytes_to_string(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 { format!("{bytes} B") } else { format!("{value:.2} {}", UNITS[unit]) }
}
