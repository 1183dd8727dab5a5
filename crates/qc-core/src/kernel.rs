//! Discrete-event simulation kernel seam
//!
//! The bridge only needs a handful of things from the hardware simulation
//! kernel: its clock, a way to let it run up to a point in time, a way to
//! submit work onto its thread, and named events CPUs can wait on. The
//! [`Kernel`] trait captures that; [`EventKernel`] is a self-contained
//! implementation with a time-ordered action queue.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{debug, trace};

/// Kernel time in nanoseconds
pub type SimTime = u64;

/// Work handed to the kernel thread
pub type KernelJob = Box<dyn FnOnce() + Send + 'static>;

/// Timed action run by the kernel when its time is reached
pub type KernelAction = Box<dyn FnOnce(&EventKernel) + Send + 'static>;

/// Named kernel event a suspended CPU can wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u32);

/// Identity of a party that holds kernel time back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(u64);

/// What the bridge consumes from the simulation kernel
pub trait Kernel: Send + Sync {
    /// Current kernel time
    fn now(&self) -> SimTime;

    /// Run every action due at or before `target`, then move the clock to `target`.
    /// Never moves time backward. Must be called on the kernel thread.
    fn run_until(&self, target: SimTime);

    /// Whether the calling thread is the kernel's own thread
    fn is_kernel_thread(&self) -> bool;

    /// Queue a job for the kernel thread. Returns false once the kernel is shut down;
    /// the job is dropped in that case.
    fn submit(&self, job: KernelJob) -> bool;

    /// Raise an event
    fn notify(&self, event: EventId);

    /// Cooperative suspension: keep running kernel activity until one of `events`
    /// has been notified. Returns false when nothing can ever notify them.
    fn wait_any(&self, events: &[EventId]) -> bool;

    /// Create a new named event
    fn new_event(&self, name: &str) -> EventId;

    /// Register a party that may hold kernel time back
    fn new_holder(&self) -> HolderId;

    /// Forbid (or with `None`, allow) free-running kernel activity past `until`
    fn hold(&self, holder: HolderId, until: Option<SimTime>);

    /// Earliest point any holder keeps kernel time at
    fn horizon(&self) -> Option<SimTime>;

    /// Counter that moves whenever kernel time, the holds or the shutdown
    /// state change
    fn progress(&self) -> u64;

    /// Block until [`Kernel::progress`] differs from `seen` or the kernel shuts down
    fn wait_progress(&self, seen: u64);

    fn is_shut_down(&self) -> bool;
}

/// `target`, pulled back to the kernel's horizon
pub fn bounded_target<K: Kernel + ?Sized>(kernel: &K, target: SimTime) -> SimTime {
    kernel.horizon().map_or(target, |horizon| horizon.min(target))
}

/// Run `f` on the kernel thread and wait for its result.
///
/// Runs inline when already on the kernel thread. Returns `None` when the kernel
/// shut down before the job ran.
pub fn run_on_kernel<K, F, R>(kernel: &K, f: F) -> Option<R>
where
    K: Kernel + ?Sized,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if kernel.is_kernel_thread() {
        return Some(f());
    }

    let (tx, rx) = channel::bounded(1);
    let submitted = kernel.submit(Box::new(move || {
        let _ = tx.send(f());
    }));
    if !submitted {
        return None;
    }
    // A dropped job drops the sender, which wakes this receive.
    rx.recv().ok()
}

struct Scheduled {
    at: SimTime,
    seq: u64,
    action: KernelAction,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for max heap to work as min heap
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct EventSlot {
    name: String,
    notified: bool,
}

/// Discrete-event kernel with a time-ordered action queue
pub struct EventKernel {
    now: AtomicU64,
    seq: AtomicU64,
    queue: Mutex<BinaryHeap<Scheduled>>,
    events: Mutex<Vec<EventSlot>>,
    holds: Mutex<HashMap<HolderId, SimTime>>,
    next_holder: AtomicU64,
    jobs_tx: Sender<KernelJob>,
    jobs_rx: Receiver<KernelJob>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    owner: Mutex<Option<ThreadId>>,
    shutdown: AtomicBool,
    progress: Mutex<u64>,
    progressed: Condvar,
}

impl EventKernel {
    /// Create a kernel owned by the calling thread
    pub fn new() -> Arc<Self> {
        let (jobs_tx, jobs_rx) = channel::unbounded();
        let (wake_tx, wake_rx) = channel::bounded(1);
        let (stop_tx, stop_rx) = channel::bounded(1);
        Arc::new(Self {
            now: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            queue: Mutex::new(BinaryHeap::new()),
            events: Mutex::new(Vec::new()),
            holds: Mutex::new(HashMap::new()),
            next_holder: AtomicU64::new(1),
            jobs_tx,
            jobs_rx,
            wake_tx,
            wake_rx,
            stop_tx,
            stop_rx,
            owner: Mutex::new(Some(std::thread::current().id())),
            shutdown: AtomicBool::new(false),
            progress: Mutex::new(0),
            progressed: Condvar::new(),
        })
    }

    /// Make the calling thread the kernel thread
    pub fn bind_current_thread(&self) {
        *self.owner.lock() = Some(std::thread::current().id());
    }

    /// Schedule an action at an absolute time. Times in the past run at the current time.
    pub fn schedule_at<F>(&self, at: SimTime, action: F)
    where
        F: FnOnce(&EventKernel) + Send + 'static,
    {
        let at = at.max(self.now());
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue.lock().push(Scheduled {
            at,
            seq,
            action: Box::new(action),
        });
        trace!("Scheduled kernel action at {} ns", at);
        self.wake();
    }

    /// Schedule an action relative to the current time
    pub fn schedule_in<F>(&self, delay: SimTime, action: F)
    where
        F: FnOnce(&EventKernel) + Send + 'static,
    {
        self.schedule_at(self.now().saturating_add(delay), action);
    }

    /// Number of timed actions not yet run
    pub fn pending_actions(&self) -> usize {
        self.queue.lock().len()
    }

    /// Time of the earliest pending action
    pub fn next_action_time(&self) -> Option<SimTime> {
        self.queue.lock().peek().map(|s| s.at)
    }

    /// Name of an event, for diagnostics
    pub fn event_name(&self, event: EventId) -> Option<String> {
        self.events
            .lock()
            .get(event.0 as usize)
            .map(|slot| slot.name.clone())
    }

    /// Serve jobs and free-running actions on the calling thread until shutdown.
    ///
    /// Used in multi-threaded mode, where CPUs hand their synchronization work to
    /// this thread.
    pub fn serve(&self) {
        self.bind_current_thread();
        debug!("Kernel thread serving");

        while !self.is_shut_down() {
            if self.step_free_run() {
                while let Ok(job) = self.jobs_rx.try_recv() {
                    job();
                }
                continue;
            }

            channel::select! {
                recv(self.jobs_rx) -> job => {
                    if let Ok(job) = job {
                        job();
                    }
                }
                recv(self.wake_rx) -> _ => {}
                recv(self.stop_rx) -> _ => break,
            }
        }

        self.discard_jobs();
        debug!("Kernel thread stopped at {} ns", self.now());
    }

    /// Stop serving and refuse further jobs. Jobs still queued are dropped so
    /// their waiters return promptly.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        let _ = self.stop_tx.try_send(());
        self.discard_jobs();
        self.bump_progress();
        debug!("Kernel shut down");
    }

    fn discard_jobs(&self) {
        while let Ok(job) = self.jobs_rx.try_recv() {
            drop(job);
        }
    }

    fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    fn bump_progress(&self) {
        *self.progress.lock() += 1;
        self.progressed.notify_all();
    }

    fn advance_to(&self, at: SimTime) {
        if self.now.fetch_max(at, AtomicOrdering::AcqRel) < at {
            self.bump_progress();
        }
    }

    fn pop_due(&self, limit: Option<SimTime>) -> Option<Scheduled> {
        let mut queue = self.queue.lock();
        match queue.peek() {
            Some(next) if limit.map_or(true, |l| next.at <= l) => queue.pop(),
            _ => None,
        }
    }

    fn run_action(&self, scheduled: Scheduled) {
        self.advance_to(scheduled.at);
        (scheduled.action)(self);
    }

    /// Run the next action if no holder keeps time behind it
    fn step_free_run(&self) -> bool {
        match self.pop_due(self.horizon()) {
            Some(scheduled) => {
                self.run_action(scheduled);
                true
            }
            None => false,
        }
    }

    fn take_notified(&self, events: &[EventId]) -> bool {
        let mut slots = self.events.lock();
        let mut hit = false;
        for event in events {
            if let Some(slot) = slots.get_mut(event.0 as usize) {
                if slot.notified {
                    slot.notified = false;
                    hit = true;
                }
            }
        }
        hit
    }
}

impl Kernel for EventKernel {
    fn now(&self) -> SimTime {
        self.now.load(AtomicOrdering::Acquire)
    }

    fn run_until(&self, target: SimTime) {
        while let Some(scheduled) = self.pop_due(Some(target)) {
            self.run_action(scheduled);
        }
        self.advance_to(target);
    }

    fn is_kernel_thread(&self) -> bool {
        *self.owner.lock() == Some(std::thread::current().id())
    }

    fn submit(&self, job: KernelJob) -> bool {
        if self.is_shut_down() {
            return false;
        }
        if self.jobs_tx.send(job).is_err() {
            return false;
        }
        // Shutdown may have raced past its own drain.
        if self.is_shut_down() {
            self.discard_jobs();
        }
        true
    }

    fn notify(&self, event: EventId) {
        if let Some(slot) = self.events.lock().get_mut(event.0 as usize) {
            trace!("Event '{}' notified", slot.name);
            slot.notified = true;
        }
        self.wake();
    }

    fn wait_any(&self, events: &[EventId]) -> bool {
        loop {
            if self.take_notified(events) {
                return true;
            }
            if self.is_shut_down() {
                return false;
            }
            if let Some(scheduled) = self.pop_due(None) {
                self.run_action(scheduled);
                continue;
            }
            match self.jobs_rx.try_recv() {
                Ok(job) => job(),
                Err(_) => return false,
            }
        }
    }

    fn new_event(&self, name: &str) -> EventId {
        let mut slots = self.events.lock();
        slots.push(EventSlot {
            name: name.to_string(),
            notified: false,
        });
        EventId((slots.len() - 1) as u32)
    }

    fn new_holder(&self) -> HolderId {
        HolderId(self.next_holder.fetch_add(1, AtomicOrdering::Relaxed))
    }

    fn hold(&self, holder: HolderId, until: Option<SimTime>) {
        {
            let mut holds = self.holds.lock();
            match until {
                Some(at) => {
                    holds.insert(holder, at);
                }
                None => {
                    holds.remove(&holder);
                }
            }
        }
        self.bump_progress();
        self.wake();
    }

    fn horizon(&self) -> Option<SimTime> {
        self.holds.lock().values().min().copied()
    }

    fn progress(&self) -> u64 {
        *self.progress.lock()
    }

    fn wait_progress(&self, seen: u64) {
        let mut progress = self.progress.lock();
        while *progress == seen && !self.is_shut_down() {
            self.progressed.wait(&mut progress);
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(AtomicOrdering::Acquire)
    }
}
