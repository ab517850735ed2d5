//! Memory manager configuration.
//!
//! Typed configuration with a bon builder and environment variable fallbacks.

use bon::bon;

pub const ONE_GB: usize = 1 << 30;

/// Default allocation granularity in bytes.
pub const DEFAULT_STEP_SIZE: usize = 1024;

/// Default number of buffers a device may hold before a collection is forced.
pub const DEFAULT_MAX_BUFFERS: usize = 1000;

/// Configuration shared by every device partition of one memory manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Requests are rounded up to a multiple of this many bytes.
    pub step_size: usize,
    /// Buffer count (free and locked) that triggers a collection before the next native allocation.
    pub max_buffers: usize,
    /// Per-device byte budget. Derived from device capacity when `None`.
    pub max_bytes: Option<usize>,
    /// Disable caching: released buffers are freed natively right away.
    pub debug: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { step_size: DEFAULT_STEP_SIZE, max_buffers: DEFAULT_MAX_BUFFERS, max_bytes: None, debug: false }
    }
}

#[bon]
impl MemoryConfig {
    /// Create a memory configuration with builder pattern.
    #[builder]
    pub fn builder(
        #[builder(default = DEFAULT_STEP_SIZE)] step_size: usize,
        #[builder(default = DEFAULT_MAX_BUFFERS)] max_buffers: usize,
        max_bytes: Option<usize>,
        #[builder(default = false)] debug: bool,
    ) -> Self {
        Self { step_size, max_buffers, max_bytes, debug }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `MOROK_MEM_STEP_SIZE` - Allocation granularity in bytes (default: 1024)
    /// * `MOROK_MAX_BUFFERS` - Buffer count that forces a collection (default: 1000)
    /// * `MOROK_MAX_BYTES` - Per-device byte budget (default: derived from capacity)
    /// * `MOROK_MEM_DEBUG` - Disable caching if set to anything but `0`
    pub fn from_env() -> Self {
        let step_size = std::env::var("MOROK_MEM_STEP_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&step: &usize| step > 0)
            .unwrap_or(DEFAULT_STEP_SIZE);
        let max_buffers =
            std::env::var("MOROK_MAX_BUFFERS").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_MAX_BUFFERS);
        let max_bytes = std::env::var("MOROK_MAX_BYTES").ok().and_then(|s| s.parse().ok());
        let debug = std::env::var("MOROK_MEM_DEBUG").is_ok_and(|v| v != "0");

        Self { step_size, max_buffers, max_bytes, debug }
    }

    /// Byte budget for a device reporting `capacity` bytes.
    pub fn budget_for(&self, capacity: usize) -> usize {
        self.max_bytes.unwrap_or_else(|| device_budget(capacity))
    }
}

/// Default byte budget for a device.
///
/// Collections start once a device holds three quarters of its memory, or
/// all but one gigabyte on large devices. Devices that report no capacity get
/// one gigabyte.
pub fn device_budget(capacity: usize) -> usize {
    if capacity == 0 {
        return ONE_GB;
    }
    (capacity / 4 * 3).max(capacity.saturating_sub(ONE_GB))
}
