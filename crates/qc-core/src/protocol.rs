//! Simulation-protocol types
//!
//! Blocking memory transactions, direct memory descriptors and the traits a
//! downstream target and the backward invalidation path implement.

use crate::kernel::SimTime;
use bitflags::bitflags;
use std::ptr::NonNull;

bitflags! {
    /// Access permissions of a direct memory grant
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

bitflags! {
    /// What an endpoint offers when two ports are bound
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        /// Blocking transport
        const TRANSPORT = 0x01;
        /// Direct memory requests
        const DIRECT_MEMORY = 0x02;
        /// Debug transport
        const DEBUG = 0x04;
        /// Backward direct memory invalidation
        const INVALIDATE = 0x08;
        /// Non-blocking transport with responses on the backward path
        const NONBLOCKING = 0x10;
    }
}

/// Identity of an initiator port within one engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InitiatorId(pub u32);

impl std::fmt::Display for InitiatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
    Ignore,
}

/// Transaction response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Incomplete,
    Ok,
    AddressError,
    CommandError,
    GenericError,
}

/// Blocking memory transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    pub command: Command,
    pub address: u64,
    pub data: Vec<u8>,
    pub status: ResponseStatus,
    /// Set by the target when the initiator may ask for direct access to this address
    pub dmi_allowed: bool,
    pub exclusive: bool,
    pub initiator: Option<InitiatorId>,
}

impl Transaction {
    pub fn new(command: Command, address: u64, len: usize) -> Self {
        Self {
            command,
            address,
            data: vec![0; len],
            status: ResponseStatus::Incomplete,
            dmi_allowed: false,
            exclusive: false,
            initiator: None,
        }
    }

    pub fn read(address: u64, len: usize) -> Self {
        Self::new(Command::Read, address, len)
    }

    pub fn write(address: u64, data: &[u8]) -> Self {
        let mut tx = Self::new(Command::Write, address, data.len());
        tx.data.copy_from_slice(data);
        tx
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Last byte address covered by the transaction
    pub fn end(&self) -> u64 {
        self.address
            .saturating_add(self.data.len().max(1) as u64 - 1)
    }
}

/// Host memory behind a direct memory grant
///
/// The pointee is owned by the target that granted it and stays valid until
/// the target invalidates the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPtr(NonNull<u8>);

// SAFETY: a HostPtr is only an address; every dereference goes through the
// owning address space under the engine lock.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Pointer `offset` bytes further into the same allocation
    ///
    /// # Safety
    /// `offset` must stay within the granted range.
    pub unsafe fn add(&self, offset: usize) -> *mut u8 {
        self.0.as_ptr().add(offset)
    }
}

/// Inclusive address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

impl AddrRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Range covering `[start, start + size)`
    pub fn with_size(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(size.max(1) - 1),
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end
    }
}

/// Direct memory descriptor returned by a granted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmiDescriptor {
    pub start: u64,
    /// Inclusive
    pub end: u64,
    pub access: AccessFlags,
    pub host: HostPtr,
    pub read_latency: SimTime,
    pub write_latency: SimTime,
}

impl DmiDescriptor {
    pub fn new(start: u64, end: u64, access: AccessFlags, host: HostPtr) -> Self {
        Self {
            start,
            end,
            access,
            host,
            read_latency: 0,
            write_latency: 0,
        }
    }

    pub fn range(&self) -> AddrRange {
        AddrRange::new(self.start, self.end)
    }

    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.range().contains(addr)
    }
}

/// Reply to a direct memory request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectMemReply {
    Denied,
    Granted(DmiDescriptor),
    /// The address sits behind translating hardware. `window` is the input range
    /// the translator covers; `grant` describes the memory `address` translates to,
    /// in the output address space, when that memory offers direct access.
    Translated {
        window: AddrRange,
        translated: u64,
        mask: u64,
        access: AccessFlags,
        grant: Option<DmiDescriptor>,
    },
}

/// Capability negotiation used when binding ports
pub trait Endpoint {
    fn capabilities(&self) -> Capabilities;

    /// Whether this endpoint can talk to a peer offering `offered`
    fn can_accept(&self, offered: Capabilities) -> bool {
        offered.contains(Capabilities::TRANSPORT)
    }
}

/// Backward direct memory invalidation path
pub trait InvalidationSink: Send + Sync {
    /// Invalidate `[start, end]`, inclusive
    fn invalidate_direct_mem(&self, start: u64, end: u64);
}

/// Downstream memory-mapped target
pub trait Target: Endpoint + Send + Sync {
    /// Blocking transport. `delay` is the local time annotation, updated in place.
    fn transport(&self, tx: &mut Transaction, delay: &mut SimTime);

    /// Side-effect free access. Returns the number of bytes handled.
    fn transport_dbg(&self, tx: &mut Transaction) -> usize {
        let mut delay = 0;
        self.transport(tx, &mut delay);
        if tx.is_ok() {
            tx.len()
        } else {
            0
        }
    }

    /// Direct memory request for `address`
    fn direct_mem(&self, _address: u64, _access: AccessFlags) -> DirectMemReply {
        DirectMemReply::Denied
    }

    /// Register the backward path. Targets keep it weakly.
    fn attach_backward(&self, _sink: std::sync::Weak<dyn InvalidationSink>) {}
}
