//! Engine native execution context
//!
//! The emulation engine has one exclusion lock shared by all of its CPUs.
//! Holding it is what makes a thread the engine's native context: only then
//! may the engine-visible address space be changed. [`EngineContext`] is the
//! proof of holding it. It is not `Send`, so work that must happen in the
//! native context is marshalled through a [`NativeQueue`] instead of being run
//! from a foreign thread.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Cross-engine exclusion lock
#[derive(Debug, Default)]
pub struct EngineLock {
    mutex: Mutex<()>,
}

impl EngineLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the native context, blocking until the lock is free
    pub fn enter(&self) -> EngineContext<'_> {
        EngineContext {
            guard: self.mutex.lock(),
        }
    }

    pub fn try_enter(&self) -> Option<EngineContext<'_>> {
        self.mutex.try_lock().map(|guard| EngineContext { guard })
    }

    pub fn is_held(&self) -> bool {
        self.mutex.is_locked()
    }
}

/// Proof that the caller runs in the engine's native context
pub struct EngineContext<'a> {
    guard: MutexGuard<'a, ()>,
}

impl EngineContext<'_> {
    /// Leave the native context while `f` runs, then re-enter it
    pub fn unlocked<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        MutexGuard::unlocked(&mut self.guard, f)
    }
}

impl std::fmt::Debug for EngineContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EngineContext")
    }
}

/// Work to run in the native context
pub type NativeJob = Box<dyn for<'a> FnOnce(&mut EngineContext<'a>) + Send + 'static>;

type Waker = Arc<dyn Fn() + Send + Sync>;

struct NativeQueueInner {
    jobs: Mutex<VecDeque<NativeJob>>,
    open: AtomicBool,
    waker: RwLock<Option<Waker>>,
    pushed: AtomicU64,
    ran: AtomicU64,
}

/// Queue of jobs for one CPU's native context
///
/// Any thread may push; the owning CPU drains the queue between executions of
/// its loop. Pushing wakes the CPU through the registered waker.
#[derive(Clone)]
pub struct NativeQueue {
    inner: Arc<NativeQueueInner>,
}

impl Default for NativeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NativeQueueInner {
                jobs: Mutex::new(VecDeque::new()),
                open: AtomicBool::new(true),
                waker: RwLock::new(None),
                pushed: AtomicU64::new(0),
                ran: AtomicU64::new(0),
            }),
        }
    }

    /// Called after every successful push
    pub fn set_waker<F>(&self, waker: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.waker.write() = Some(Arc::new(waker));
    }

    /// Queue a job. Returns false, dropping the job, once the queue is closed.
    pub fn push<F>(&self, job: F) -> bool
    where
        F: for<'a> FnOnce(&mut EngineContext<'a>) + Send + 'static,
    {
        {
            let mut jobs = self.inner.jobs.lock();
            if !self.inner.open.load(Ordering::Acquire) {
                return false;
            }
            jobs.push_back(Box::new(job));
        }
        self.inner.pushed.fetch_add(1, Ordering::Relaxed);

        let waker = self.inner.waker.read().clone();
        if let Some(waker) = waker {
            waker();
        }
        true
    }

    /// Run every queued job, including jobs queued by the jobs themselves
    pub fn drain(&self, ctx: &mut EngineContext<'_>) -> usize {
        let mut count = 0;
        loop {
            let job = self.inner.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job(ctx);
                    count += 1;
                }
                None => break,
            }
        }
        if count > 0 {
            self.inner.ran.fetch_add(count as u64, Ordering::Relaxed);
            trace!("Drained {} native jobs", count);
        }
        count
    }

    /// Refuse further jobs and drop the queued ones. Returns how many were dropped.
    pub fn close(&self) -> usize {
        let mut jobs = self.inner.jobs.lock();
        self.inner.open.store(false, Ordering::Release);
        let dropped = jobs.len();
        jobs.clear();
        dropped
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.jobs.lock().is_empty()
    }

    /// (pushed, ran) job counters
    pub fn stats(&self) -> (u64, u64) {
        (
            self.inner.pushed.load(Ordering::Relaxed),
            self.inner.ran.load(Ordering::Relaxed),
        )
    }
}
