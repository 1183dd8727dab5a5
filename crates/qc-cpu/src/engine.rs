//! Emulation engine seam
//!
//! A [`CpuCore`] is the engine's execution loop for one CPU. The driver calls
//! it in the engine native context with a budget; the core runs until the
//! budget's deadline, an exit request, or a blocking condition, and reports
//! why it stopped.

use crate::initiator::InitiatorBridge;
use qc_core::context::EngineContext;
use qc_core::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};

/// Why the engine's execution loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The deadline in the budget was reached
    QuantumExpired,
    /// Somebody requested an exit (interrupt, pending native work, sync needed)
    Kicked,
    /// The core has nothing to execute
    Idle,
    /// Unrecoverable engine failure
    Fault(String),
}

/// Loop exit report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopExit {
    pub reason: ExitReason,
}

impl LoopExit {
    pub fn new(reason: ExitReason) -> Self {
        Self { reason }
    }
}

/// What the core may consume in one run
#[derive(Debug)]
pub struct RunBudget<'a> {
    /// Engine clock value the core must not run past
    pub deadline: u64,
    /// Interrupt line level at loop entry
    pub irq: bool,
    exit_request: &'a AtomicBool,
}

impl<'a> RunBudget<'a> {
    pub fn new(deadline: u64, irq: bool, exit_request: &'a AtomicBool) -> Self {
        Self {
            deadline,
            irq,
            exit_request,
        }
    }

    /// Polled by the core between instructions
    pub fn exit_requested(&self) -> bool {
        self.exit_request.load(Ordering::Acquire)
    }
}

/// Per-CPU execution loop of the emulation engine
pub trait CpuCore: Send {
    /// Execute until the budget is spent or an exit is requested. Memory
    /// accesses go through `port`. An `Err` is process-fatal.
    fn run(
        &mut self,
        ctx: &mut EngineContext<'_>,
        port: &InitiatorBridge,
        budget: &RunBudget<'_>,
    ) -> Result<LoopExit>;

    /// Whether the core could make progress given the interrupt level
    fn has_work(&self, irq: bool) -> bool;

    /// Absolute engine virtual clock, in ticks
    fn clock(&self) -> u64;

    fn set_halted(&mut self, halted: bool);

    /// Architectural reset. The virtual clock may restart.
    fn reset(&mut self);
}
