//! Execution driver
//!
//! One driver per CPU. It runs the engine's execution loop in quanta, hands
//! elapsed time to the quantum keeper between runs, suspends the CPU when it
//! has nothing to do and wakes it on external stimulus (halt, reset and
//! interrupt lines, native work).
//!
//! [`CpuControl`] is the shareable half: signal callbacks, the instance and
//! foreign threads talk to it. [`CpuDriver`] owns the core and is stepped by
//! exactly one thread.

use crate::engine::{CpuCore, ExitReason, RunBudget};
use crate::idle::IdleStrategy;
use crate::initiator::InitiatorBridge;
use crate::instance::Instance;
use parking_lot::Mutex;
use qc_core::context::{EngineContext, EngineLock, NativeQueue};
use qc_core::error::{EngineError, Result};
use qc_core::quantum::{EngineClock, KeeperStatus, QuantumKeeper};
use qc_core::registry::Handle;
use qc_core::signal::SignalLine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// CPU execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    PoweredOff,
    Halted,
    Running,
    StoppedForSync,
    /// Terminal
    Finished,
}

impl ExecState {
    pub fn can_transition_to(self, next: ExecState) -> bool {
        use ExecState::*;
        match (self, next) {
            (Finished, _) => false,
            (_, Finished) => true,
            (from, to) if from == to => true,
            (PoweredOff, Halted)
            | (Halted, Running)
            | (Running, StoppedForSync)
            | (Running, Halted)
            | (StoppedForSync, Running)
            | (StoppedForSync, Halted) => true,
            _ => false,
        }
    }
}

/// Engine-clock deadline handed to the core as its run budget
#[derive(Debug, Default)]
pub struct DeadlineTimer {
    deadline: Mutex<Option<u64>>,
    rearm: AtomicBool,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, deadline: u64) {
        *self.deadline.lock() = Some(deadline);
        trace!("Deadline armed at tick {}", deadline);
    }

    pub fn cancel(&self) {
        *self.deadline.lock() = None;
    }

    pub fn deadline(&self) -> Option<u64> {
        *self.deadline.lock()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.lock().is_some()
    }

    pub fn expired(&self, clock: u64) -> bool {
        self.deadline.lock().is_some_and(|deadline| clock >= deadline)
    }

    /// Ask the driver to re-arm from its own thread
    pub fn request_rearm(&self) {
        self.rearm.store(true, Ordering::Release);
    }

    pub fn take_rearm(&self) -> bool {
        self.rearm.swap(false, Ordering::AcqRel)
    }
}

/// Shareable control block of one CPU
pub struct CpuControl {
    name: String,
    state: Mutex<ExecState>,
    finished: AtomicBool,
    halted: AtomicBool,
    reset_pending: AtomicBool,
    irq: AtomicBool,
    /// Whether the CPU had work at its last step
    runnable: AtomicBool,
    exit_request: Arc<AtomicBool>,
    idle: Arc<dyn IdleStrategy>,
    keeper: Arc<QuantumKeeper>,
    timer: DeadlineTimer,
    native: NativeQueue,
    port: Arc<InitiatorBridge>,
}

impl CpuControl {
    pub fn new(
        name: impl Into<String>,
        idle: Arc<dyn IdleStrategy>,
        keeper: Arc<QuantumKeeper>,
        native: NativeQueue,
        exit_request: Arc<AtomicBool>,
        port: Arc<InitiatorBridge>,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ExecState::PoweredOff),
            finished: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            reset_pending: AtomicBool::new(false),
            irq: AtomicBool::new(false),
            runnable: AtomicBool::new(true),
            exit_request,
            idle,
            keeper,
            timer: DeadlineTimer::new(),
            native,
            port,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ExecState {
        *self.state.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn irq_level(&self) -> bool {
        self.irq.load(Ordering::Acquire)
    }

    pub fn is_runnable(&self) -> bool {
        self.runnable.load(Ordering::Acquire) && !self.is_finished()
    }

    pub fn keeper(&self) -> &Arc<QuantumKeeper> {
        &self.keeper
    }

    pub fn port(&self) -> &Arc<InitiatorBridge> {
        &self.port
    }

    pub fn native(&self) -> &NativeQueue {
        &self.native
    }

    pub fn timer(&self) -> &DeadlineTimer {
        &self.timer
    }

    /// Move to `next` if the state machine allows it
    pub fn transition(&self, next: ExecState) -> bool {
        let mut state = self.state.lock();
        if self.is_finished() && next != ExecState::Finished {
            return false;
        }
        if !state.can_transition_to(next) {
            trace!("CPU '{}': {:?} -> {:?} refused", self.name, *state, next);
            return false;
        }
        if *state != next {
            trace!("CPU '{}': {:?} -> {:?}", self.name, *state, next);
            *state = next;
        }
        true
    }

    /// Make the CPU leave its execution loop and re-evaluate
    pub fn kick(&self) {
        self.exit_request.store(true, Ordering::Release);
        self.idle.signal();
    }

    /// Halt line changed
    pub fn on_halt(&self, level: bool) {
        if self.is_finished() {
            return;
        }
        let was = self.halted.swap(level, Ordering::AcqRel);
        if was == level {
            return;
        }
        if level {
            self.timer.cancel();
            self.keeper.stop();
            self.transition(ExecState::Halted);
            debug!("CPU '{}' halted", self.name);
        } else {
            self.keeper.start();
            self.timer.request_rearm();
            debug!("CPU '{}' released from halt", self.name);
        }
        self.kick();
    }

    /// Reset line changed. The reset itself runs on the CPU's native context.
    pub fn on_reset(&self, level: bool) {
        if self.is_finished() || !level {
            return;
        }
        self.reset_pending.store(true, Ordering::Release);
        self.keeper.reset();
        self.keeper.start();
        debug!("CPU '{}' reset requested", self.name);
        self.kick();
    }

    /// Interrupt line changed
    pub fn on_irq(&self, level: bool) {
        if self.is_finished() {
            return;
        }
        self.irq.store(level, Ordering::Release);
        trace!("CPU '{}' irq {}", self.name, level);
        self.kick();
    }

    /// Run `job` on this CPU's native context. Returns false once finished.
    pub fn async_run<F>(&self, job: F) -> bool
    where
        F: for<'a> FnOnce(&mut EngineContext<'a>) + Send + 'static,
    {
        if self.is_finished() {
            return false;
        }
        self.native.push(job)
    }

    /// Enter the terminal state. Wakes anything waiting on this CPU.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock() = ExecState::Finished;
        self.keeper.stop();
        self.timer.cancel();
        let dropped = self.native.close();
        self.port.finish();
        info!("CPU '{}' finished ({} native jobs dropped)", self.name, dropped);

        self.exit_request.store(true, Ordering::Release);
        self.idle.signal();
    }

    /// Route halt, reset and interrupt lines to this CPU
    pub fn connect_signals(self: &Arc<Self>, halt: &SignalLine, reset: &SignalLine, irq: &SignalLine) {
        let weak = Arc::downgrade(self);
        halt.on_change(move |level| {
            if let Some(control) = weak.upgrade() {
                control.on_halt(level);
            }
        });
        let weak = Arc::downgrade(self);
        reset.on_change(move |level| {
            if let Some(control) = weak.upgrade() {
                control.on_reset(level);
            }
        });
        let weak = Arc::downgrade(self);
        irq.on_change(move |level| {
            if let Some(control) = weak.upgrade() {
                control.on_irq(level);
            }
        });
    }
}

impl std::fmt::Debug for CpuControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuControl")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("halted", &self.is_halted())
            .field("irq", &self.irq_level())
            .finish()
    }
}

/// Result of one driver step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The core executed
    Ran,
    /// The CPU had nothing to do and was suspended
    Idle,
    /// The CPU had nothing to do and gave way to other runnable CPUs
    Yielded,
    Finished,
}

/// Drives one CPU's execution loop
pub struct CpuDriver {
    handle: Handle,
    control: Arc<CpuControl>,
    core: Box<dyn CpuCore>,
    engine: Arc<EngineLock>,
    instance: Arc<Instance>,
    /// Last idle wake-up consumed
    seen: u64,
    clock: EngineClock,
    core_halted: bool,
    powered: bool,
}

impl CpuDriver {
    pub(crate) fn new(
        handle: Handle,
        control: Arc<CpuControl>,
        core: Box<dyn CpuCore>,
        engine: Arc<EngineLock>,
        instance: Arc<Instance>,
    ) -> Self {
        Self {
            handle,
            control,
            core,
            engine,
            instance,
            seen: 0,
            clock: EngineClock::new(),
            core_halted: false,
            powered: false,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn control(&self) -> &Arc<CpuControl> {
        &self.control
    }

    pub fn name(&self) -> &str {
        self.control.name()
    }

    /// One round of the loop: service native work, then either run a quantum
    /// and reconcile time, or suspend until there is work.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let control = self.control.clone();
        if control.is_finished() {
            return Ok(StepOutcome::Finished);
        }

        if !self.powered {
            self.powered = true;
            control.transition(ExecState::Halted);
            info!("CPU '{}' powered on", control.name());
        }

        // Kicks from here on stay visible to the core
        control.exit_request.store(false, Ordering::Release);
        self.service_native();

        let halted = control.is_halted();
        if halted != self.core_halted {
            self.core.set_halted(halted);
            self.core_halted = halted;
        }
        let irq = control.irq_level();

        if halted || !self.core.has_work(irq) {
            control.runnable.store(false, Ordering::Release);
            control.transition(ExecState::Halted);
            if control.idle.yields_to_others() && self.instance.can_run() {
                return Ok(StepOutcome::Yielded);
            }
            if !self.wait_for_work() {
                info!("CPU '{}': nothing left that could wake it", control.name());
                control.finish();
                return Ok(StepOutcome::Finished);
            }
            return Ok(if control.is_finished() {
                StepOutcome::Finished
            } else {
                StepOutcome::Idle
            });
        }

        control.runnable.store(true, Ordering::Release);
        if !control.transition(ExecState::Running) {
            return Ok(StepOutcome::Finished);
        }
        if control.keeper.status() != KeeperStatus::Running {
            control.keeper.start();
        }
        // Sets the baseline after power-on or reset
        control
            .keeper
            .observe_engine_clock(&mut self.clock, self.core.clock());
        if !control.timer.is_armed() || control.timer.take_rearm() {
            control
                .timer
                .arm(self.core.clock().saturating_add(control.keeper.quantum_ticks()));
        }
        let deadline = control.timer.deadline().unwrap_or(u64::MAX);

        let exit = {
            let engine = self.engine.clone();
            let mut ctx = engine.enter();
            let budget = RunBudget::new(deadline, irq, &control.exit_request);
            let exit = self.core.run(&mut ctx, &control.port, &budget);
            control.native.drain(&mut ctx);
            exit
        };

        control.transition(ExecState::StoppedForSync);
        self.sync_with_kernel();

        let exit = exit?;
        trace!("CPU '{}' left its loop: {:?}", control.name(), exit.reason);
        match exit.reason {
            ExitReason::Fault(message) => {
                error!("CPU '{}' faulted: {}", control.name(), message);
                Err(EngineError::Unrecoverable {
                    cpu: control.name().to_string(),
                    message,
                }
                .into())
            }
            _ => Ok(StepOutcome::Ran),
        }
    }

    /// Apply a pending reset and run queued native jobs
    fn service_native(&mut self) {
        let control = self.control.clone();
        let engine = self.engine.clone();
        let mut ctx = engine.enter();

        if control.reset_pending.swap(false, Ordering::AcqRel) {
            self.core.reset();
            self.clock.reset();
            control.port.reset(&ctx);
            control.timer.cancel();
            control.timer.request_rearm();
            info!("CPU '{}' reset", control.name());
        }
        control.native.drain(&mut ctx);
    }

    fn wait_for_work(&mut self) -> bool {
        let control = self.control.clone();
        if control.native.has_pending() || control.reset_pending.load(Ordering::Acquire) {
            return true;
        }
        control.keeper.stop();
        trace!("CPU '{}' waiting for work", control.name());
        control.idle.suspend(&control.finished, &mut self.seen)
    }

    /// Feed elapsed engine time to the keeper and let the kernel catch up
    fn sync_with_kernel(&mut self) {
        let control = &self.control;
        let clock = self.core.clock();
        control.keeper.observe_engine_clock(&mut self.clock, clock);

        if control.timer.expired(clock) {
            control
                .timer
                .arm(clock.saturating_add(control.keeper.quantum_ticks()));
        }

        let reconciliation = control.keeper.reconcile();
        if reconciliation.need_sync && !control.keeper.sync() {
            trace!("CPU '{}': sync skipped", control.name());
        }
    }

    /// Step until finished. A fatal error finishes the CPU and is returned.
    pub fn run(mut self) -> Result<()> {
        info!("CPU '{}' driver started", self.name());
        let result = loop {
            match self.step() {
                Ok(StepOutcome::Finished) => break Ok(()),
                Ok(_) => {}
                Err(e) => {
                    error!("CPU '{}' stopped: {}", self.name(), e);
                    break Err(e);
                }
            }
        };
        self.teardown();
        result
    }

    /// Finish the CPU, release its port and leave the instance
    pub fn teardown(self) {
        self.control.finish();
        self.control.keeper.stop();
        {
            let ctx = self.engine.enter();
            self.control.port.teardown(&ctx);
        }
        if self.instance.remove_cpu(self.handle).is_err() {
            trace!("CPU '{}' already removed", self.name());
        }
        debug!("CPU '{}' torn down", self.name());
    }
}
