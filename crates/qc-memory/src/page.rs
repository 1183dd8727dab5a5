//! Page geometry and alignment helpers

/// Engine-imposed minimum page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageGeometry {
    bits: u32,
}

impl Default for PageGeometry {
    fn default() -> Self {
        Self::new(12)
    }
}

impl PageGeometry {
    pub fn new(bits: u32) -> Self {
        Self { bits: bits.min(63) }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Get the size in bytes
    pub fn bytes(&self) -> u64 {
        1 << self.bits
    }

    /// Offset mask within one page
    pub fn mask(&self) -> u64 {
        self.bytes() - 1
    }

    /// Check if address is aligned to this page size
    pub fn is_aligned(&self, addr: u64) -> bool {
        addr & self.mask() == 0
    }

    /// Align address down to page boundary
    pub fn align_down(&self, addr: u64) -> u64 {
        addr & !self.mask()
    }

    /// Align address up to page boundary
    pub fn align_up(&self, addr: u64) -> u64 {
        addr.saturating_add(self.mask()) & !self.mask()
    }
}

/// Largest naturally aligned block around `addr` that fits inside `[start, end]`.
///
/// Returned as an offset mask, so the block is `[addr & !mask, addr | mask]`.
/// A zero mask means a single byte.
pub fn aligned_block_mask(addr: u64, start: u64, end: u64) -> u64 {
    debug_assert!(start <= addr && addr <= end);
    for bits in (1..=63u32).rev() {
        let mask = (1u64 << bits) - 1;
        if addr & !mask >= start && addr | mask <= end {
            return mask;
        }
    }
    0
}
