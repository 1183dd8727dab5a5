//! Core types for the qcosim co-simulation bridge
//!
//! This crate provides time keeping, the simulation-kernel and protocol
//! seams, the engine native context, error handling, configuration and
//! logging shared by the memory and CPU crates.

pub mod config;
pub mod context;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod protocol;
pub mod quantum;
pub mod registry;
pub mod signal;

pub use config::{Config, IdleScope, SyncPolicy, ThreadModel};
pub use context::{EngineContext, EngineLock, NativeJob, NativeQueue};
pub use error::{BridgeError, Result};
pub use kernel::{run_on_kernel, EventId, EventKernel, Kernel, SimTime};
pub use protocol::{
    AccessFlags, AddrRange, Capabilities, Command, DirectMemReply, DmiDescriptor, Endpoint,
    HostPtr, InitiatorId, InvalidationSink, ResponseStatus, Target, Transaction,
};
pub use quantum::{EngineClock, KeeperStatus, QuantumKeeper, Reconciliation, TickRatio};
pub use registry::{Handle, Registry};
pub use signal::SignalLine;
