//! Direct access region manager
//!
//! One manager per engine instance. It owns every direct region handed out by
//! targets and every alias placing one of those regions in an initiator's
//! address space. A single coarse lock serializes all mutations; the mutations
//! themselves additionally require the engine native context.

use crate::address_space::AddressSpace;
use crate::region::{AliasId, DirectRegion, RegionAlias, RegionKey};
use crossbeam::channel::{self, Receiver};
use parking_lot::Mutex;
use qc_core::context::{EngineContext, NativeQueue};
use qc_core::error::{CapacityError, Result};
use qc_core::protocol::{DmiDescriptor, InitiatorId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Result of work marshalled onto the native context
#[derive(Debug)]
pub struct Completion<T> {
    rx: Receiver<T>,
}

impl<T> Completion<T> {
    /// Block until the job ran. `None` when it was dropped instead, for
    /// example because the CPU owning the queue finished.
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn try_get(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
struct InitiatorAliases {
    space: Arc<AddressSpace>,
    aliases: BTreeMap<u64, Arc<RegionAlias>>,
}

#[derive(Debug, Default)]
struct DmiState {
    regions: BTreeMap<RegionKey, DirectRegion>,
    initiators: HashMap<InitiatorId, InitiatorAliases>,
}

impl DmiState {
    fn initiator(&mut self, id: InitiatorId) -> &mut InitiatorAliases {
        self.initiators.entry(id).or_insert_with(|| InitiatorAliases {
            space: Arc::new(AddressSpace::new(id)),
            aliases: BTreeMap::new(),
        })
    }

    /// Uninstall and forget one alias, destroying its region when unused
    fn remove_alias(&mut self, ctx: &EngineContext<'_>, id: InitiatorId, start: u64) -> bool {
        let alias = match self.initiators.get_mut(&id) {
            Some(entry) => match entry.aliases.remove(&start) {
                Some(alias) => {
                    entry.space.uninstall(ctx, &alias);
                    alias
                }
                None => return false,
            },
            None => return false,
        };

        let unused = self
            .regions
            .get_mut(&alias.region())
            .map(|region| region.release())
            .unwrap_or(false);
        if unused {
            debug_assert!(!alias.is_installed());
            self.regions.remove(&alias.region());
            info!(
                "Destroyed direct region host=0x{:x} size=0x{:x}",
                alias.region().host,
                alias.region().size
            );
        }
        true
    }

    /// Starts of `id`'s aliases intersecting `[start, end]`
    fn overlapping(&self, id: InitiatorId, start: u64, end: u64) -> Vec<u64> {
        match self.initiators.get(&id) {
            Some(entry) => entry
                .aliases
                .range(..=end)
                .filter(|(_, alias)| alias.end() >= start)
                .map(|(key, _)| *key)
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Registry of direct regions and their per-initiator aliases
#[derive(Debug)]
pub struct DmiManager {
    limit: usize,
    state: Mutex<DmiState>,
    next_alias: AtomicU64,
}

impl DmiManager {
    /// Create a manager allowing `limit` live aliases per initiator
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(DmiState::default()),
            next_alias: AtomicU64::new(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Address space of an initiator, created on first use
    pub fn register_initiator(&self, id: InitiatorId) -> Arc<AddressSpace> {
        self.state.lock().initiator(id).space.clone()
    }

    pub fn address_space(&self, id: InitiatorId) -> Option<Arc<AddressSpace>> {
        self.state
            .lock()
            .initiators
            .get(&id)
            .map(|entry| entry.space.clone())
    }

    /// Remove an initiator with all of its aliases
    pub fn unregister_initiator(&self, ctx: &EngineContext<'_>, id: InitiatorId) -> usize {
        let removed = self.remove_initiator_aliases(ctx, id);
        self.state.lock().initiators.remove(&id);
        removed
    }

    /// Return the alias mapping `desc` for `initiator`, creating the region
    /// and alias as needed.
    ///
    /// Aliases of the same initiator overlapping the new placement are
    /// replaced. Exceeding the per-initiator ceiling is fatal.
    pub fn get_or_create_alias(
        &self,
        ctx: &EngineContext<'_>,
        initiator: InitiatorId,
        desc: &DmiDescriptor,
    ) -> Result<Arc<RegionAlias>> {
        let mut state = self.state.lock();

        if let Some(existing) = state.initiator(initiator).aliases.get(&desc.start) {
            if existing.maps(desc) && existing.is_installed() {
                return Ok(existing.clone());
            }
        }

        for start in state.overlapping(initiator, desc.start, desc.end) {
            debug!(
                "Replacing alias at 0x{:x} for initiator {} with [0x{:x}, 0x{:x}]",
                start, initiator, desc.start, desc.end
            );
            state.remove_alias(ctx, initiator, start);
        }

        if state.initiator(initiator).aliases.len() >= self.limit {
            error!(
                "Initiator {} exceeded {} direct access aliases",
                initiator, self.limit
            );
            return Err(CapacityError::TooManyAliases {
                initiator: initiator.0,
                limit: self.limit,
            }
            .into());
        }

        let key = RegionKey::of(desc);
        state
            .regions
            .entry(key)
            .or_insert_with(|| {
                info!(
                    "Created direct region host=0x{:x} size=0x{:x} {:?}",
                    key.host, key.size, desc.access
                );
                DirectRegion::new(key, desc)
            })
            .retain();

        let id = AliasId(self.next_alias.fetch_add(1, Ordering::Relaxed));
        let alias = Arc::new(RegionAlias::new(id, initiator, desc));
        let entry = state.initiator(initiator);
        entry.space.install(ctx, alias.clone());
        entry.aliases.insert(desc.start, alias.clone());

        info!(
            "Initiator {} aliased [0x{:x}, 0x{:x}] ({} live)",
            initiator,
            desc.start,
            desc.end,
            entry.aliases.len()
        );
        Ok(alias)
    }

    /// Remove every alias intersecting `[start, end]` across all initiators,
    /// then destroy regions left without aliases. Aliases are removed whole.
    pub fn invalidate(&self, ctx: &EngineContext<'_>, start: u64, end: u64) -> usize {
        let mut state = self.state.lock();
        let ids: Vec<InitiatorId> = state.initiators.keys().copied().collect();

        let mut removed = 0;
        for id in ids {
            for key in state.overlapping(id, start, end) {
                if state.remove_alias(ctx, id, key) {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(
                "Invalidated [0x{:x}, 0x{:x}]: {} aliases removed",
                start, end, removed
            );
        }
        removed
    }

    /// Remove one initiator's aliases intersecting `[start, end]`
    pub fn invalidate_for(&self, ctx: &EngineContext<'_>, id: InitiatorId, start: u64, end: u64) -> usize {
        let mut state = self.state.lock();
        state
            .overlapping(id, start, end)
            .into_iter()
            .filter(|key| state.remove_alias(ctx, id, *key))
            .count()
    }

    /// Remove every alias of one initiator
    pub fn remove_initiator_aliases(&self, ctx: &EngineContext<'_>, id: InitiatorId) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<u64> = match state.initiators.get(&id) {
            Some(entry) => entry.aliases.keys().copied().collect(),
            None => return 0,
        };
        keys.into_iter()
            .filter(|key| state.remove_alias(ctx, id, *key))
            .count()
    }

    /// `get_or_create_alias` from any thread, run on the native context behind `queue`
    pub fn request_alias(
        self: &Arc<Self>,
        queue: &NativeQueue,
        initiator: InitiatorId,
        desc: DmiDescriptor,
    ) -> Completion<Result<Arc<RegionAlias>>> {
        let (tx, rx) = channel::bounded(1);
        let manager = self.clone();
        queue.push(move |ctx: &mut EngineContext<'_>| {
            let _ = tx.send(manager.get_or_create_alias(ctx, initiator, &desc));
        });
        Completion { rx }
    }

    /// `invalidate` from any thread, run on the native context behind `queue`
    pub fn request_invalidate(
        self: &Arc<Self>,
        queue: &NativeQueue,
        start: u64,
        end: u64,
    ) -> Completion<usize> {
        let (tx, rx) = channel::bounded(1);
        let manager = self.clone();
        queue.push(move |ctx: &mut EngineContext<'_>| {
            let _ = tx.send(manager.invalidate(ctx, start, end));
        });
        Completion { rx }
    }

    pub fn region_count(&self) -> usize {
        self.state.lock().regions.len()
    }

    pub fn alias_count(&self, id: InitiatorId) -> usize {
        self.state
            .lock()
            .initiators
            .get(&id)
            .map_or(0, |entry| entry.aliases.len())
    }

    pub fn total_aliases(&self) -> usize {
        self.state
            .lock()
            .initiators
            .values()
            .map(|entry| entry.aliases.len())
            .sum()
    }

    /// Aliases still referencing a region, for diagnostics
    pub fn region_aliases(&self, key: RegionKey) -> usize {
        self.state
            .lock()
            .regions
            .get(&key)
            .map_or(0, |region| region.alias_count())
    }
}
