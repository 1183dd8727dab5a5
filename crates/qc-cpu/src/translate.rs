//! Address-translating regions
//!
//! A translating region covers a window of an initiator's address space that
//! sits behind translation hardware. Each region has its own translation cache,
//! its own address space for passthrough aliases, and the grants of nested
//! translators its entries point into.

use parking_lot::Mutex;
use qc_core::context::EngineContext;
use qc_core::error::{Result, TranslationError};
use qc_core::protocol::{AccessFlags, AddrRange, DmiDescriptor, InitiatorId};
use qc_memory::{AddressSpace, CacheStats, TranslationCache, TranslationEntry, TranslationTarget};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct TranslatingRegion {
    id: InitiatorId,
    window: AddrRange,
    space: Arc<AddressSpace>,
    cache: Mutex<TranslationCache>,
    nested: Mutex<BTreeMap<u64, DmiDescriptor>>,
}

impl TranslatingRegion {
    pub fn new(id: InitiatorId, window: AddrRange, space: Arc<AddressSpace>) -> Self {
        Self {
            id,
            window,
            space,
            cache: Mutex::new(TranslationCache::new()),
            nested: Mutex::new(BTreeMap::new()),
        }
    }

    /// Identity of the region's own address space in the region manager
    pub fn id(&self) -> InitiatorId {
        self.id
    }

    pub fn window(&self) -> AddrRange {
        self.window
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn lookup(&self, addr: u64) -> Option<TranslationEntry> {
        self.cache.lock().lookup(addr)
    }

    pub fn insert(&self, entry: TranslationEntry) {
        self.cache.lock().insert(entry);
    }

    /// Record the grant of a nested translator. Overlapping a different grant
    /// is a configuration error.
    pub fn add_nested(&self, desc: DmiDescriptor) -> Result<()> {
        let mut nested = self.nested.lock();
        if let Some(conflict) = nested
            .values()
            .find(|existing| existing.range().overlaps(desc.start, desc.end))
        {
            if *conflict == desc {
                return Ok(());
            }
            return Err(TranslationError::Overlap {
                start: desc.start,
                end: desc.end,
                existing_start: conflict.start,
                existing_end: conflict.end,
            }
            .into());
        }
        debug!(
            "Nested translation target [0x{:x}, 0x{:x}] behind region 0x{:x}",
            desc.start, desc.end, self.window.start
        );
        nested.insert(desc.start, desc);
        Ok(())
    }

    fn nested_for(&self, addr: u64, len: usize, access: AccessFlags) -> Option<(DmiDescriptor, usize)> {
        let nested = self.nested.lock();
        let (_, desc) = nested.range(..=addr).next_back()?;
        let last = addr.checked_add((len.max(1) - 1) as u64)?;
        if !desc.contains(addr) || last > desc.end || !desc.access.contains(access) {
            return None;
        }
        Some((*desc, (addr - desc.start) as usize))
    }

    /// Read output memory of a nested translator directly
    pub fn nested_read(&self, _ctx: &EngineContext<'_>, addr: u64, buf: &mut [u8]) -> bool {
        match self.nested_for(addr, buf.len(), AccessFlags::READ) {
            Some((desc, offset)) => {
                // SAFETY: the grant covers the access and the granting target keeps
                // it alive until it invalidates the range, which purges it here.
                unsafe {
                    std::ptr::copy_nonoverlapping(desc.host.add(offset), buf.as_mut_ptr(), buf.len());
                }
                true
            }
            None => false,
        }
    }

    /// Write output memory of a nested translator directly
    pub fn nested_write(&self, _ctx: &EngineContext<'_>, addr: u64, data: &[u8]) -> bool {
        match self.nested_for(addr, data.len(), AccessFlags::WRITE) {
            Some((desc, offset)) => {
                // SAFETY: see `nested_read`.
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), desc.host.add(offset), data.len());
                }
                true
            }
            None => false,
        }
    }

    /// Drop cached translations whose input intersects `[start, end]`, nested
    /// grants intersecting it, and every entry resolving into such a grant.
    pub fn purge(&self, start: u64, end: u64) -> usize {
        let dropped: Vec<AddrRange> = {
            let mut nested = self.nested.lock();
            let keys: Vec<u64> = nested
                .values()
                .filter(|desc| desc.range().overlaps(start, end))
                .map(|desc| desc.start)
                .collect();
            keys.iter()
                .filter_map(|key| nested.remove(key))
                .map(|desc| desc.range())
                .collect()
        };

        let mut cache = self.cache.lock();
        let mut purged = cache.purge(start, end);
        if !dropped.is_empty() {
            purged += cache.purge_where(|entry| {
                entry.target == TranslationTarget::Nested
                    && dropped
                        .iter()
                        .any(|range| range.overlaps(entry.translated, entry.translated | entry.mask))
            });
        }
        if purged > 0 {
            debug!(
                "Purged {} translations for [0x{:x}, 0x{:x}] in region 0x{:x}",
                purged, start, end, self.window.start
            );
        }
        purged
    }

    /// Whether an invalidation of `[start, end]` concerns this region
    pub fn is_affected_by(&self, start: u64, end: u64) -> bool {
        self.window.overlaps(start, end)
            || self
                .nested
                .lock()
                .values()
                .any(|desc| desc.range().overlaps(start, end))
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
        self.nested.lock().clear();
    }

    pub fn entry_count(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

impl std::fmt::Debug for TranslatingRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslatingRegion")
            .field("id", &self.id)
            .field("window", &self.window)
            .field("entries", &self.entry_count())
            .finish()
    }
}
