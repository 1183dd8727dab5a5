//! Translation cache for address-translating regions
//!
//! Entries cover naturally aligned blocks described by an offset mask and are
//! keyed by their base address. A lookup takes the entry with the largest base
//! at or below the address and hits only when the address masks down to
//! exactly that base.

use qc_core::protocol::AccessFlags;
use std::collections::BTreeMap;

/// Where a translated address is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationTarget {
    /// The initiator's own view of the system, through aliases or transactions
    System,
    /// Memory behind a nested translator, resolved through its grant
    Nested,
}

/// One cached translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationEntry {
    /// Input base, already masked
    pub iova: u64,
    pub target: TranslationTarget,
    /// Output base
    pub translated: u64,
    pub mask: u64,
    pub access: AccessFlags,
}

impl TranslationEntry {
    pub fn new(addr: u64, target: TranslationTarget, translated: u64, mask: u64, access: AccessFlags) -> Self {
        Self {
            iova: addr & !mask,
            target,
            translated: translated & !mask,
            mask,
            access,
        }
    }

    /// Last input address covered
    pub fn last(&self) -> u64 {
        self.iova | self.mask
    }

    pub fn matches(&self, addr: u64) -> bool {
        addr & !self.mask == self.iova
    }

    /// Output address for `addr`, which must match this entry
    pub fn translate(&self, addr: u64) -> u64 {
        self.translated + (addr & self.mask)
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.iova <= end && start <= self.last()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fills: u64,
    pub purged: u64,
}

/// Ordered range map of translation entries
#[derive(Debug, Default)]
pub struct TranslationCache {
    entries: BTreeMap<u64, TranslationEntry>,
    stats: CacheStats,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the entry covering `addr`
    pub fn lookup(&mut self, addr: u64) -> Option<TranslationEntry> {
        let hit = self
            .entries
            .range(..=addr)
            .next_back()
            .map(|(_, entry)| *entry)
            .filter(|entry| entry.matches(addr));
        match hit {
            Some(_) => self.stats.hits += 1,
            None => self.stats.misses += 1,
        }
        hit
    }

    /// Insert an entry, replacing any entries it overlaps
    pub fn insert(&mut self, entry: TranslationEntry) {
        let stale: Vec<u64> = self
            .entries
            .range(..=entry.last())
            .filter(|(_, existing)| existing.last() >= entry.iova)
            .map(|(base, _)| *base)
            .collect();
        for base in stale {
            self.entries.remove(&base);
        }
        self.entries.insert(entry.iova, entry);
        self.stats.fills += 1;
    }

    /// Remove every entry whose input block intersects `[start, end]`
    pub fn purge(&mut self, start: u64, end: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.overlaps(start, end));
        let purged = before - self.entries.len();
        self.stats.purged += purged as u64;
        purged
    }

    /// Remove entries satisfying `pred`
    pub fn purge_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&TranslationEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !pred(entry));
        let purged = before - self.entries.len();
        self.stats.purged += purged as u64;
        purged
    }

    pub fn clear(&mut self) {
        self.stats.purged += self.entries.len() as u64;
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
