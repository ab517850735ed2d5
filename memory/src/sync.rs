//! Event tokens for outstanding device work.
//!
//! Device queues advance a monotonically increasing timeline signal as work
//! retires. An [`Event`] names one point on such a timeline: it is complete
//! once the signal reaches its value.
//!
//! # Example
//!
//! ```ignore
//! let signal = Arc::new(CpuTimelineSignal::new());
//! let event = Event::new(signal.clone(), 1);
//!
//! signal.set(1);      // work item 1 retired
//! event.wait()?;      // returns immediately
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RuntimeSnafu};

/// Monotonic timeline signal.
///
/// The value only increases; waiters block until it reaches their target.
pub trait TimelineSignal: Send + Sync + fmt::Debug {
    /// Current signal value.
    fn value(&self) -> u64;

    /// Advance the signal. Values lower than the current one are ignored.
    fn set(&self, value: u64);

    /// Block until the signal reaches `value`, or until `timeout` elapses.
    ///
    /// `None` waits forever.
    fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<()>;

    /// Check whether the signal has reached `value` without blocking.
    fn is_reached(&self, value: u64) -> bool {
        self.value() >= value
    }
}

/// Host timeline signal backed by an atomic counter and a parking_lot condvar.
#[derive(Debug, Default)]
pub struct CpuTimelineSignal {
    value: AtomicU64,
    // Guards nothing; only pairs with the condvar.
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl CpuTimelineSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(initial: u64) -> Self {
        Self { value: AtomicU64::new(initial), ..Self::default() }
    }
}

impl TimelineSignal for CpuTimelineSignal {
    fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn set(&self, value: u64) {
        self.value.fetch_max(value, Ordering::AcqRel);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    fn wait(&self, target: u64, timeout: Option<Duration>) -> Result<()> {
        if self.is_reached(target) {
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.mutex.lock();
        while !self.is_reached(target) {
            match deadline {
                None => self.condvar.wait(&mut guard),
                Some(deadline) => {
                    if self.condvar.wait_until(&mut guard, deadline).timed_out() && !self.is_reached(target) {
                        return RuntimeSnafu {
                            message: format!(
                                "timeline signal timeout: waited for value {target}, current {}",
                                self.value()
                            ),
                        }
                        .fail();
                    }
                }
            }
        }
        Ok(())
    }
}

/// A point on a queue's timeline: "everything issued up to here".
///
/// Events are owned by exactly one holder at a time and are deliberately not
/// `Clone`. The memory manager stores them next to free buffers and hands
/// them to the next owner.
pub struct Event {
    signal: Arc<dyn TimelineSignal>,
    value: u64,
}

impl Event {
    pub fn new(signal: Arc<dyn TimelineSignal>, value: u64) -> Self {
        Self { signal, value }
    }

    /// Timeline value this event waits for.
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn signal(&self) -> &Arc<dyn TimelineSignal> {
        &self.signal
    }

    pub fn is_complete(&self) -> bool {
        self.signal.is_reached(self.value)
    }

    /// Block the host until the work behind this event has retired.
    pub fn wait(&self) -> Result<()> {
        self.signal.wait(self.value, None)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.signal.wait(self.value, Some(timeout))
    }

    /// Whether both events name the same point of the same timeline.
    pub fn same_point(&self, other: &Event) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.signal), Arc::as_ptr(&other.signal)) && self.value == other.value
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("value", &self.value).field("complete", &self.is_complete()).finish()
    }
}
