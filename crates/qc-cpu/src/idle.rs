//! Idle strategies
//!
//! How a CPU with nothing to do suspends and how it is woken. The strategy is
//! picked once when the CPU is created; the driver never asks which one it has.

use parking_lot::{Condvar, Mutex};
use qc_core::kernel::{EventId, Kernel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

pub trait IdleStrategy: Send + Sync {
    /// Suspend until woken or `finished` is set. `seen` is the caller's record of
    /// the last wake-up it consumed. Returns false when nothing can ever wake
    /// the caller.
    fn suspend(&self, finished: &AtomicBool, seen: &mut u64) -> bool;

    /// Announce that work may be available. Callable from any thread.
    fn signal(&self);

    /// Whether an idle CPU should hand the thread to other runnable CPUs
    /// rather than suspending
    fn yields_to_others(&self) -> bool;
}

/// Suspends inside the simulation kernel's own event wait
///
/// Used when the engine and the kernel share one native thread: while the CPU
/// waits, the kernel keeps processing its own activity until the wake event
/// fires. No OS blocking takes place.
pub struct CooperativeIdle {
    kernel: Arc<dyn Kernel>,
    wake: EventId,
}

impl CooperativeIdle {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        let wake = kernel.new_event("cpu-wake");
        Self { kernel, wake }
    }

    pub fn wake_event(&self) -> EventId {
        self.wake
    }
}

impl IdleStrategy for CooperativeIdle {
    fn suspend(&self, finished: &AtomicBool, _seen: &mut u64) -> bool {
        if finished.load(Ordering::Acquire) {
            return true;
        }
        self.kernel.wait_any(&[self.wake])
    }

    fn signal(&self) {
        self.kernel.notify(self.wake);
    }

    fn yields_to_others(&self) -> bool {
        true
    }
}

/// Suspends on a condition variable
///
/// Wake-ups are counted, so a waiter that observed every wake-up so far sleeps
/// and any newer one releases it. Spurious wake-ups just go back to sleep.
/// One instance may be shared by all CPUs of an engine instance.
#[derive(Default)]
pub struct ThreadedIdle {
    generation: Mutex<u64>,
    cond: Condvar,
    round_robin: bool,
}

impl ThreadedIdle {
    pub fn new() -> Self {
        Self::default()
    }

    /// For CPUs that take turns on one thread: an idle CPU gives way while any
    /// other CPU is runnable and only suspends once all of them are idle
    pub fn round_robin() -> Self {
        Self {
            round_robin: true,
            ..Self::default()
        }
    }
}

impl IdleStrategy for ThreadedIdle {
    fn suspend(&self, finished: &AtomicBool, seen: &mut u64) -> bool {
        let mut generation = self.generation.lock();
        while *generation == *seen && !finished.load(Ordering::Acquire) {
            self.cond.wait(&mut generation);
        }
        *seen = *generation;
        trace!("Idle CPU woken at generation {}", *generation);
        true
    }

    fn signal(&self) {
        *self.generation.lock() += 1;
        self.cond.notify_all();
    }

    fn yields_to_others(&self) -> bool {
        self.round_robin
    }
}
