//! Device command queue abstraction.
//!
//! The memory managers never submit work themselves. They only need two
//! things from a queue: a snapshot event of everything issued so far (attached
//! to buffers on release) and a queue-ordered wait on an event (honored when a
//! cached buffer is handed to its next owner).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::sync::{CpuTimelineSignal, Event, TimelineSignal};

/// In-order device command queue.
///
/// # Thread Safety
///
/// Queues are shared between the allocator and its consumers, so every
/// operation takes `&self`.
pub trait CommandQueue: Send + Sync + fmt::Debug {
    /// Make work submitted after this call wait for `event`.
    ///
    /// Does not block the host.
    fn enqueue_wait(&self, event: &Event) -> Result<()>;

    /// Event that completes once all work issued so far has retired.
    fn make_event(&self) -> Result<Event>;

    /// Block the host until all issued work has retired.
    fn finish(&self) -> Result<()>;
}

/// Host emulation of an in-order device queue.
///
/// Work is represented by tickets: [`HostQueue::issue`] marks a new piece of
/// outstanding work and [`HostQueue::retire`] completes everything up to a
/// ticket, after first honoring the waits enqueued before it.
pub struct HostQueue {
    device: usize,
    signal: Arc<CpuTimelineSignal>,
    issued: AtomicU64,
    dependencies: Mutex<Vec<(Arc<dyn TimelineSignal>, u64)>>,
    waits_enqueued: AtomicUsize,
}

impl fmt::Debug for HostQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostQueue")
            .field("device", &self.device)
            .field("issued", &self.issued())
            .field("retired", &self.retired())
            .finish()
    }
}

impl HostQueue {
    pub fn new(device: usize) -> Self {
        Self {
            device,
            signal: Arc::new(CpuTimelineSignal::new()),
            issued: AtomicU64::new(0),
            dependencies: Mutex::new(Vec::new()),
            waits_enqueued: AtomicUsize::new(0),
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    /// Record a new piece of outstanding work and return its ticket.
    pub fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Complete all work up to and including `ticket`.
    ///
    /// Blocks until every enqueued cross-queue wait is satisfied.
    pub fn retire(&self, ticket: u64) -> Result<()> {
        let dependencies = std::mem::take(&mut *self.dependencies.lock());
        for (signal, value) in dependencies {
            signal.wait(value, None)?;
        }
        self.signal.set(ticket.min(self.issued()));
        Ok(())
    }

    pub fn retire_all(&self) -> Result<()> {
        self.retire(self.issued())
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn retired(&self) -> u64 {
        self.signal.value()
    }

    /// Number of waits enqueued over the lifetime of the queue.
    pub fn waits_enqueued(&self) -> usize {
        self.waits_enqueued.load(Ordering::Acquire)
    }
}

impl CommandQueue for HostQueue {
    fn enqueue_wait(&self, event: &Event) -> Result<()> {
        self.waits_enqueued.fetch_add(1, Ordering::AcqRel);
        // Waits on our own timeline are implied by in-order execution.
        let own = std::ptr::addr_eq(Arc::as_ptr(event.signal()), Arc::as_ptr(&self.signal));
        if !own && !event.is_complete() {
            self.dependencies.lock().push((Arc::clone(event.signal()), event.value()));
        }
        Ok(())
    }

    fn make_event(&self) -> Result<Event> {
        Ok(Event::new(self.signal.clone(), self.issued()))
    }

    fn finish(&self) -> Result<()> {
        self.retire_all()
    }
}
