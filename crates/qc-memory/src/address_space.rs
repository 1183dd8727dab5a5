//! Engine-visible address space of one initiator
//!
//! Holds the installed aliases the engine reads and writes through without
//! issuing transactions. Every operation takes an [`EngineContext`], so the
//! map is only ever touched from the engine's native context.

use crate::region::RegionAlias;
use parking_lot::RwLock;
use qc_core::context::EngineContext;
use qc_core::protocol::{AccessFlags, InitiatorId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Installed aliases of one initiator, keyed by start address
#[derive(Debug)]
pub struct AddressSpace {
    initiator: InitiatorId,
    mapped: RwLock<BTreeMap<u64, Arc<RegionAlias>>>,
}

impl AddressSpace {
    pub fn new(initiator: InitiatorId) -> Self {
        Self {
            initiator,
            mapped: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn initiator(&self) -> InitiatorId {
        self.initiator
    }

    pub(crate) fn install(&self, _ctx: &EngineContext<'_>, alias: Arc<RegionAlias>) {
        trace!(
            "Installing alias [0x{:x}, 0x{:x}] for initiator {}",
            alias.start(),
            alias.end(),
            self.initiator
        );
        alias.set_installed(true);
        self.mapped.write().insert(alias.start(), alias);
    }

    pub(crate) fn uninstall(&self, _ctx: &EngineContext<'_>, alias: &RegionAlias) -> bool {
        let mut mapped = self.mapped.write();
        let removed = match mapped.get(&alias.start()) {
            Some(current) if current.id() == alias.id() => mapped.remove(&alias.start()).is_some(),
            _ => false,
        };
        alias.set_installed(false);
        removed
    }

    /// Alias mapping `addr`, if any
    pub fn lookup(&self, _ctx: &EngineContext<'_>, addr: u64) -> Option<Arc<RegionAlias>> {
        self.mapped
            .read()
            .range(..=addr)
            .next_back()
            .filter(|(_, alias)| alias.range().contains(addr))
            .map(|(_, alias)| alias.clone())
    }

    /// Read through the direct pointer. Returns false when no installed alias
    /// covers the whole access with read permission.
    pub fn read(&self, ctx: &EngineContext<'_>, addr: u64, buf: &mut [u8]) -> bool {
        let alias = match self.lookup(ctx, addr) {
            Some(alias) if alias.covers(addr, buf.len()) && alias.access().contains(AccessFlags::READ) => alias,
            _ => return false,
        };
        let offset = (addr - alias.start()) as usize;
        // SAFETY: the alias covers the access and stays installed while we hold
        // the engine context; the granting target keeps the memory alive until
        // it invalidates the range, which must go through this context.
        unsafe {
            std::ptr::copy_nonoverlapping(alias.host().add(offset), buf.as_mut_ptr(), buf.len());
        }
        true
    }

    /// Write through the direct pointer. Returns false when no installed alias
    /// covers the whole access with write permission.
    pub fn write(&self, ctx: &EngineContext<'_>, addr: u64, data: &[u8]) -> bool {
        let alias = match self.lookup(ctx, addr) {
            Some(alias) if alias.covers(addr, data.len()) && alias.access().contains(AccessFlags::WRITE) => alias,
            _ => return false,
        };
        let offset = (addr - alias.start()) as usize;
        // SAFETY: see `read`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), alias.host().add(offset), data.len());
        }
        true
    }

    pub fn len(&self) -> usize {
        self.mapped.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapped.read().is_empty()
    }

    /// Snapshot of the installed aliases in address order
    pub fn aliases(&self) -> Vec<Arc<RegionAlias>> {
        self.mapped.read().values().cloned().collect()
    }
}
