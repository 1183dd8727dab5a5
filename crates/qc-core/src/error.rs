//! Error types for the qcosim bridge

use thiserror::Error;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Capacity exhausted: {0}")]
    Capacity(#[from] CapacityError),

    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Stale handle: {0}")]
    StaleHandle(String),

    #[error("Port {0} has been torn down")]
    TornDown(String),
}

impl BridgeError {
    /// Whether this error must terminate the simulation.
    ///
    /// Addressing errors never reach this type; they travel in the
    /// transaction response instead.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(_) | Self::Capacity(_) | Self::Translation(_) | Self::Engine(_) => true,
            Self::Config(_) => true,
            Self::Io(_) | Self::StaleHandle(_) | Self::TornDown(_) => false,
        }
    }
}

/// Wiring bugs detected on the simulation-protocol path
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Target returned command error at 0x{addr:x}")]
    CommandError { addr: u64 },

    #[error("Target left transaction at 0x{addr:x} incomplete")]
    IncompleteResponse { addr: u64 },

    #[error("Endpoint {port} only offers the non-blocking path, which is not supported")]
    BackwardPath { port: String },

    #[error("Target resized transaction at 0x{addr:x} from {expected} to {actual} bytes")]
    LengthMismatch { addr: u64, expected: usize, actual: usize },

    #[error("Port {0} is not bound to a target")]
    Unbound(String),

    #[error("Endpoint {port} cannot be bound: {reason}")]
    IncompatibleEndpoint { port: String, reason: String },
}

/// Resource ceilings
#[derive(Error, Debug)]
pub enum CapacityError {
    #[error(
        "initiator {initiator} requested more than {limit} direct access aliases, \
         consider routing this memory through a translating region"
    )]
    TooManyAliases { initiator: u32, limit: usize },
}

/// Address translation configuration errors
#[derive(Error, Debug)]
pub enum TranslationError {
    #[error(
        "translating region [0x{start:x}, 0x{end:x}] overlaps existing region \
         [0x{existing_start:x}, 0x{existing_end:x}]"
    )]
    Overlap {
        start: u64,
        end: u64,
        existing_start: u64,
        existing_end: u64,
    },
}

/// Errors reported by the emulation engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("CPU {cpu} stopped on unrecoverable error: {message}")]
    Unrecoverable { cpu: String, message: String },
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
