//! Direct access regions and their aliases

use qc_core::protocol::{AccessFlags, AddrRange, DmiDescriptor, HostPtr, InitiatorId};
use std::sync::atomic::{AtomicBool, Ordering};

/// Identity of a direct access region: the host memory and its size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    pub host: usize,
    pub size: u64,
}

impl RegionKey {
    pub fn of(desc: &DmiDescriptor) -> Self {
        Self {
            host: desc.host.addr(),
            size: desc.size(),
        }
    }
}

/// Host memory exposed to the engine. Its size never changes once created.
#[derive(Debug)]
pub struct DirectRegion {
    key: RegionKey,
    host: HostPtr,
    access: AccessFlags,
    alias_count: usize,
}

impl DirectRegion {
    pub(crate) fn new(key: RegionKey, desc: &DmiDescriptor) -> Self {
        Self {
            key,
            host: desc.host,
            access: desc.access,
            alias_count: 0,
        }
    }

    pub fn key(&self) -> RegionKey {
        self.key
    }

    pub fn host(&self) -> HostPtr {
        self.host
    }

    pub fn size(&self) -> u64 {
        self.key.size
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn alias_count(&self) -> usize {
        self.alias_count
    }

    pub(crate) fn retain(&mut self) {
        self.alias_count += 1;
    }

    /// Drop one alias reference, returning true when none remain
    pub(crate) fn release(&mut self) -> bool {
        self.alias_count = self.alias_count.saturating_sub(1);
        self.alias_count == 0
    }
}

/// Unique alias identifier within one manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AliasId(pub u64);

/// Placement of a direct region in one initiator's address space
#[derive(Debug)]
pub struct RegionAlias {
    id: AliasId,
    initiator: InitiatorId,
    range: AddrRange,
    access: AccessFlags,
    host: HostPtr,
    region: RegionKey,
    installed: AtomicBool,
}

impl RegionAlias {
    pub(crate) fn new(id: AliasId, initiator: InitiatorId, desc: &DmiDescriptor) -> Self {
        Self {
            id,
            initiator,
            range: desc.range(),
            access: desc.access,
            host: desc.host,
            region: RegionKey::of(desc),
            installed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> AliasId {
        self.id
    }

    pub fn initiator(&self) -> InitiatorId {
        self.initiator
    }

    pub fn range(&self) -> AddrRange {
        self.range
    }

    pub fn start(&self) -> u64 {
        self.range.start
    }

    pub fn end(&self) -> u64 {
        self.range.end
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn region(&self) -> RegionKey {
        self.region
    }

    pub fn host(&self) -> HostPtr {
        self.host
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    pub(crate) fn set_installed(&self, installed: bool) {
        self.installed.store(installed, Ordering::Release);
    }

    /// Whether this alias already maps exactly what `desc` grants
    pub fn maps(&self, desc: &DmiDescriptor) -> bool {
        self.region == RegionKey::of(desc) && self.range == desc.range() && self.access == desc.access
    }

    /// Whether `[addr, addr + len)` lies inside the alias
    pub fn covers(&self, addr: u64, len: usize) -> bool {
        let last = match addr.checked_add((len.max(1) - 1) as u64) {
            Some(last) => last,
            None => return false,
        };
        self.range.contains(addr) && last <= self.range.end
    }
}
