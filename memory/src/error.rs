use snafu::Snafu;

use crate::buffer::BufferPtr;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Requested allocation size is zero or does not fit in `usize` after rounding.
    #[snafu(display("invalid allocation size: {bytes} bytes"))]
    InvalidSize { bytes: usize },

    /// Typed request whose byte size does not fit in `usize`.
    #[snafu(display("allocation of {count} elements of {elem_size} bytes overflows"))]
    SizeOverflow { count: usize, elem_size: usize },

    /// Device id outside of the initialized partitions.
    #[snafu(display("invalid device {device}: {count} device(s) available"))]
    InvalidDevice { device: usize, count: usize },

    /// Allocation could not be satisfied even after garbage collection.
    #[snafu(display("out of memory on device {device}: requested {bytes} bytes, budget {max_bytes} bytes"))]
    OutOfMemory { device: usize, bytes: usize, max_bytes: usize },

    /// Native device layer failure (allocation, release, map, unmap, context switch).
    #[snafu(display("device error: {message}"))]
    Device { message: String },

    /// Pointer is not tracked by the manager.
    #[snafu(display("buffer {ptr} is not owned by this memory manager"))]
    UnknownBuffer { ptr: BufferPtr },

    #[snafu(display("runtime error: {message}"))]
    Runtime { message: String },

    #[snafu(display("memory managers are already installed"))]
    AlreadyInstalled,
}

impl Error {
    /// Whether the caller may recover by releasing memory and retrying.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}
