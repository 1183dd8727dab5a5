//! Time keeper
//!
//! Tracks how far a CPU has run ahead of the simulation kernel and decides
//! when it must yield. Engine time arrives as ticks of the engine's virtual
//! clock; kernel time is nanoseconds. The two are related by a fixed power of
//! two so conversions never round time backward.
//!
//! Bookkeeping invariant: every nanosecond fed in through [`QuantumKeeper::advance`]
//! is either synced to the kernel or still pending, never both and never lost.

use crate::config::SyncPolicy;
use crate::kernel::{bounded_target, run_on_kernel, HolderId, Kernel, SimTime};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

/// Fixed engine-tick to kernel-time ratio: one tick is `1 << shift` ns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickRatio {
    shift: u32,
}

impl TickRatio {
    pub fn new(shift: u32) -> Self {
        Self { shift: shift.min(63) }
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Engine ticks to kernel nanoseconds
    pub fn to_kernel(&self, ticks: u64) -> SimTime {
        ticks.checked_shl(self.shift).filter(|ns| ns >> self.shift == ticks).unwrap_or(u64::MAX)
    }

    /// Kernel nanoseconds to whole engine ticks, rounding down
    pub fn to_ticks(&self, ns: SimTime) -> u64 {
        ns >> self.shift
    }
}

/// Keeper run status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeeperStatus {
    /// Created but never started
    Idle,
    /// The owning CPU is executing and holds kernel time at its sync point
    Running,
    /// The owning CPU is idle or halted and does not hold the kernel back
    Stopped,
}

/// Outcome of one reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reconciliation {
    pub need_sync: bool,
    /// Time handed to the kernel by this reconciliation
    pub synced: SimTime,
    /// Time still pending after it
    pub carry_over: SimTime,
}

/// Per-CPU view of the engine's absolute virtual clock
///
/// Turns clock readings into elapsed ticks. Only forward movement since the
/// previous reading counts; the first reading after creation or a reset only
/// sets the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineClock {
    last: Option<u64>,
}

impl EngineClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks elapsed since the previous reading
    pub fn observe(&mut self, clock: u64) -> u64 {
        match self.last {
            Some(prev) if clock > prev => {
                self.last = Some(clock);
                clock - prev
            }
            Some(_) => 0,
            None => {
                self.last = Some(clock);
                0
            }
        }
    }

    /// Forget the baseline, for when the engine clock restarts
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[derive(Debug)]
struct KeeperState {
    status: KeeperStatus,
    /// Kernel time this keeper's accounting started from
    base: SimTime,
    synced_total: SimTime,
    pending: SimTime,
    advanced_total: SimTime,
    forced: bool,
}

impl KeeperState {
    fn synced_time(&self) -> SimTime {
        self.base.saturating_add(self.synced_total)
    }

    fn local_time(&self) -> SimTime {
        self.synced_time().saturating_add(self.pending)
    }

    fn advance_ns(&mut self, ns: SimTime) {
        self.pending = self.pending.saturating_add(ns);
        self.advanced_total = self.advanced_total.saturating_add(ns);
    }
}

/// Per-CPU (or shared) quantum keeper
pub struct QuantumKeeper {
    quantum: SimTime,
    ratio: TickRatio,
    policy: SyncPolicy,
    kernel: Arc<dyn Kernel>,
    holder: HolderId,
    state: Mutex<KeeperState>,
}

impl QuantumKeeper {
    pub fn new(quantum: SimTime, ratio: TickRatio, policy: SyncPolicy, kernel: Arc<dyn Kernel>) -> Self {
        let holder = kernel.new_holder();
        let base = kernel.now();
        Self {
            quantum: quantum.max(1),
            ratio,
            policy,
            kernel,
            holder,
            state: Mutex::new(KeeperState {
                status: KeeperStatus::Idle,
                base,
                synced_total: 0,
                pending: 0,
                advanced_total: 0,
                forced: false,
            }),
        }
    }

    pub fn quantum(&self) -> SimTime {
        self.quantum
    }

    /// The quantum expressed in engine ticks, never zero
    pub fn quantum_ticks(&self) -> u64 {
        self.ratio.to_ticks(self.quantum).max(1)
    }

    pub fn ratio(&self) -> TickRatio {
        self.ratio
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn status(&self) -> KeeperStatus {
        self.state.lock().status
    }

    /// Resume accounting. Local time catches up with the kernel if the CPU was
    /// left behind while it was stopped.
    pub fn start(&self) {
        let mut state = self.state.lock();
        let now = self.kernel.now();
        let local = state.local_time();
        if now > local {
            state.base += now - local;
        }
        state.status = KeeperStatus::Running;
        self.kernel.hold(self.holder, Some(state.synced_time()));
        trace!("Keeper started at {} ns", state.local_time());
    }

    /// Stop holding the kernel back
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.status = KeeperStatus::Stopped;
        self.kernel.hold(self.holder, None);
        trace!("Keeper stopped at {} ns", state.local_time());
    }

    /// Drop a pending forced sync
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.forced = false;
        debug!("Keeper reset with {} ns pending", state.pending);
    }

    /// Account for elapsed engine ticks
    pub fn advance(&self, ticks: u64) {
        let ns = self.ratio.to_kernel(ticks);
        self.state.lock().advance_ns(ns);
    }

    /// Account for the ticks `clock` moved since its previous reading
    pub fn observe_engine_clock(&self, clock: &mut EngineClock, reading: u64) {
        let ticks = clock.observe(reading);
        if ticks > 0 {
            self.advance(ticks);
        }
    }

    /// Request a sync at the next reconciliation regardless of the budget
    pub fn force_sync(&self) {
        self.state.lock().forced = true;
    }

    /// Whether the CPU should leave its loop and sync. A budget that has been
    /// used up exactly counts as exhausted. Under `Unconstrained` only a forced
    /// sync counts.
    pub fn needs_sync(&self) -> bool {
        let state = self.state.lock();
        match self.policy {
            SyncPolicy::Unconstrained => state.forced,
            _ => state.forced || state.pending >= self.quantum,
        }
    }

    /// Remaining budget before a sync becomes mandatory
    pub fn time_to_sync(&self) -> SimTime {
        self.quantum.saturating_sub(self.state.lock().pending)
    }

    /// Hand whole quanta of pending time to the kernel side of the ledger.
    ///
    /// A forced sync hands over everything; otherwise the remainder below one
    /// quantum is carried over to the next round.
    pub fn reconcile(&self) -> Reconciliation {
        let mut state = self.state.lock();

        let result = if state.forced {
            Reconciliation {
                need_sync: true,
                synced: state.pending,
                carry_over: 0,
            }
        } else if state.pending >= self.quantum {
            let carry_over = state.pending % self.quantum;
            Reconciliation {
                need_sync: true,
                synced: state.pending - carry_over,
                carry_over,
            }
        } else {
            Reconciliation {
                need_sync: false,
                synced: 0,
                carry_over: state.pending,
            }
        };

        state.synced_total = state.synced_total.saturating_add(result.synced);
        state.pending = result.carry_over;
        state.forced = false;
        if state.status == KeeperStatus::Running {
            self.kernel.hold(self.holder, Some(state.synced_time()));
        }

        trace!(
            "Reconciled: synced {} ns, carry {} ns",
            result.synced,
            result.carry_over
        );
        result
    }

    /// Let the kernel catch up with the synced point.
    ///
    /// `Cooperative` runs the kernel straight to it, inline on the kernel
    /// thread or as a blocking handoff. `MultiThread` never takes the kernel
    /// past the slowest running keeper: off the kernel thread it blocks until
    /// every other hold has moved past the synced point. `Unconstrained` queues
    /// the catch-up and returns at once.
    ///
    /// Returns false when the keeper is stopped or the kernel has shut down.
    pub fn sync(&self) -> bool {
        let target = {
            let state = self.state.lock();
            if state.status == KeeperStatus::Stopped {
                return false;
            }
            state.synced_time()
        };

        match self.policy {
            SyncPolicy::Cooperative => {
                if self.kernel.now() >= target {
                    return true;
                }
                let kernel = self.kernel.clone();
                run_on_kernel(self.kernel.as_ref(), move || kernel.run_until(target)).is_some()
            }
            SyncPolicy::MultiThread => self.sync_bounded(target),
            SyncPolicy::Unconstrained => self.sync_detached(target),
        }
    }

    fn sync_bounded(&self, target: SimTime) -> bool {
        loop {
            if self.status() == KeeperStatus::Stopped {
                return false;
            }
            // Taken before looking so a change in between still wakes the wait
            let seen = self.kernel.progress();
            if self.kernel.now() >= target {
                return true;
            }

            let kernel = self.kernel.clone();
            let reached = run_on_kernel(self.kernel.as_ref(), move || {
                kernel.run_until(bounded_target(kernel.as_ref(), target));
                kernel.now() >= target
            });
            match reached {
                None => return false,
                Some(true) => return true,
                // The kernel thread cannot wait on itself
                Some(false) if self.kernel.is_kernel_thread() => return true,
                Some(false) => {
                    trace!("Sync to {} ns waiting at {} ns", target, self.kernel.now());
                    self.kernel.wait_progress(seen);
                }
            }
        }
    }

    fn sync_detached(&self, target: SimTime) -> bool {
        if self.kernel.now() >= target {
            return true;
        }
        if self.kernel.is_kernel_thread() {
            self.kernel.run_until(target);
            return true;
        }
        let kernel = self.kernel.clone();
        self.kernel.submit(Box::new(move || kernel.run_until(target)))
    }

    /// Absolute local time of the owning CPU
    pub fn local_time(&self) -> SimTime {
        self.state.lock().local_time()
    }

    /// Absolute time last handed to the kernel
    pub fn synced_time(&self) -> SimTime {
        self.state.lock().synced_time()
    }

    /// How far local time is ahead of the kernel
    pub fn local_offset(&self) -> SimTime {
        self.local_time().saturating_sub(self.kernel.now())
    }

    /// Move local time to `kernel.now() + offset`. Quietly refuses to move backward.
    pub fn set_local_offset(&self, offset: SimTime) {
        let target = self.kernel.now().saturating_add(offset);
        let mut state = self.state.lock();
        let local = state.local_time();
        if target > local {
            state.advance_ns(target - local);
        }
    }

    pub fn pending(&self) -> SimTime {
        self.state.lock().pending
    }

    pub fn advanced_total(&self) -> SimTime {
        self.state.lock().advanced_total
    }

    pub fn synced_total(&self) -> SimTime {
        self.state.lock().synced_total
    }
}

impl Drop for QuantumKeeper {
    fn drop(&mut self) {
        self.kernel.hold(self.holder, None);
    }
}
