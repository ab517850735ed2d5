//! Caching device memory for morok.
//!
//! Native device allocation is slow and races with asynchronous device work,
//! so buffers are recycled through a per-device, size-bucketed cache.
//!
//! - [`MemoryManager`] is the cache engine, parameterized by a [`NativeAllocator`].
//! - [`DeviceAllocator`] and [`PinnedAllocator`] bind it to plain device memory
//!   and to host-mapped device memory.
//! - [`Backend`] is the device context consumed from the compute API; [`HostBackend`]
//!   emulates one over host memory.
//! - [`api`] exposes the process-wide allocation functions.

pub mod allocator;
pub mod api;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod manager;
pub mod queue;
pub mod registry;
pub mod sync;


pub use allocator::{DeviceAllocator, NativeAllocator, PinnedAllocator};
pub use backend::{Backend, BufferOptions, HostBackend};
pub use buffer::{BufferPtr, DeviceBuffer};
pub use config::MemoryConfig;
pub use error::{Error, Result};
pub use manager::{Allocation, BufferInfo, MemoryManager, MemoryReport};
pub use queue::{CommandQueue, HostQueue};
pub use registry::{MemoryRegistry, install, registry, shutdown};
pub use sync::{CpuTimelineSignal, Event, TimelineSignal};
