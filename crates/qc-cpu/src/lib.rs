//! CPU side of the qcosim bridge
//!
//! This crate implements:
//! - The initiator bridge turning engine memory accesses into transactions
//! - Translating regions and their caches
//! - The per-CPU execution driver and its idle strategies
//! - The instance coordinator owning CPUs and the region manager

pub mod driver;
pub mod engine;
pub mod idle;
pub mod initiator;
pub mod instance;
pub mod translate;

pub use driver::{CpuControl, CpuDriver, DeadlineTimer, ExecState, StepOutcome};
pub use engine::{CpuCore, ExitReason, LoopExit, RunBudget};
pub use idle::{CooperativeIdle, IdleStrategy, ThreadedIdle};
pub use initiator::{AccessAttrs, AccessResult, InitiatorBridge, PortStats, PortWiring};
pub use instance::{Instance, InstanceParams};
pub use translate::TranslatingRegion;
