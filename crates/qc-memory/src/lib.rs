//! Direct memory management for the qcosim bridge
//!
//! This crate keeps the engine's direct-pointer view of simulated memory:
//! direct access regions granted by targets, their per-initiator aliases,
//! and the translation caches used for address-translating regions.

pub mod address_space;
pub mod manager;
pub mod page;
pub mod region;
pub mod tlb;

pub use address_space::AddressSpace;
pub use manager::{Completion, DmiManager};
pub use page::{aligned_block_mask, PageGeometry};
pub use region::{AliasId, DirectRegion, RegionAlias, RegionKey};
pub use tlb::{CacheStats, TranslationCache, TranslationEntry, TranslationTarget};
