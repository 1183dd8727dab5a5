//! Initiator bridge
//!
//! Turns raw engine memory accesses of one port into simulation-protocol
//! transactions, and keeps the port's direct-pointer view up to date: flat
//! aliases for memory that grants direct access, translating regions with
//! their caches for memory behind translation hardware.
//!
//! Lock order: engine lock, then the port lock. A regular access gives the
//! engine lock up while the transaction is pending on the kernel thread; the
//! port lock stays held, so at most one regular access per port is in flight.
//! An access issued while the same thread is already inside an access of this
//! port (a side effect of the first one) takes the uncached direct path.
//!
//! Every invalidation bumps the port's fill epoch. Aliases, nested grants and
//! translation entries learnt from a target are only installed if the epoch
//! did not move between asking the target and installing the result, and the
//! check and the install happen under the epoch lock invalidations take.

use crate::translate::TranslatingRegion;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use qc_core::context::{EngineContext, NativeQueue};
use qc_core::error::{BridgeError, ProtocolError, Result, TranslationError};
use qc_core::kernel::{run_on_kernel, Kernel, SimTime};
use qc_core::protocol::{
    AccessFlags, AddrRange, Capabilities, Command, DirectMemReply, DmiDescriptor, Endpoint,
    InitiatorId, InvalidationSink, ResponseStatus, Target, Transaction,
};
use qc_core::quantum::QuantumKeeper;
use qc_memory::{aligned_block_mask, AddressSpace, DmiManager, PageGeometry, TranslationEntry, TranslationTarget};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace, warn};

/// Attributes of one engine memory access
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessAttrs {
    /// Atomic or exclusive access: issued directly, never cached
    pub exclusive: bool,
    /// Side-effect free debugger access
    pub debug: bool,
}

impl AccessAttrs {
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            debug: false,
        }
    }

    pub fn debug() -> Self {
        Self {
            exclusive: false,
            debug: true,
        }
    }
}

/// Non-fatal outcome of an access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessResult {
    Ok,
    /// Nothing decodes the address
    DecodeError,
    Error,
}

/// What a port needs from its instance
#[derive(Clone)]
pub struct PortWiring {
    pub kernel: Arc<dyn Kernel>,
    pub keeper: Arc<QuantumKeeper>,
    pub dmi: Arc<DmiManager>,
    /// Jobs for the owning CPU's native context
    pub native: NativeQueue,
    /// Raised to make the owning CPU leave its execution loop
    pub exit_request: Arc<AtomicBool>,
    /// Source of address-space identities for translating regions
    pub ids: Arc<AtomicU32>,
    pub page: PageGeometry,
    pub verify_translations: bool,
}

/// Snapshot of a port's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Transactions handed to the kernel thread
    pub transactions: u64,
    /// Exclusive and reentrant accesses issued inline
    pub direct: u64,
    pub reentrant: u64,
    pub debug: u64,
    /// Accesses served through an alias or a translation
    pub fast_path: u64,
    pub invalidations: u64,
}

#[derive(Debug, Default)]
struct PortCounters {
    transactions: AtomicU64,
    direct: AtomicU64,
    reentrant: AtomicU64,
    debug: AtomicU64,
    fast_path: AtomicU64,
    invalidations: AtomicU64,
}

impl PortCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PortStats {
        PortStats {
            transactions: self.transactions.load(Ordering::Relaxed),
            direct: self.direct.load(Ordering::Relaxed),
            reentrant: self.reentrant.load(Ordering::Relaxed),
            debug: self.debug.load(Ordering::Relaxed),
            fast_path: self.fast_path.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

/// What a computed translation needs installed before it may be cached
enum Fill {
    Nothing,
    Nested(DmiDescriptor),
    Alias(DmiDescriptor),
}

#[derive(Clone)]
struct BoundTarget {
    target: Arc<dyn Target>,
    caps: Capabilities,
}

/// Per-port memory access bridge
pub struct InitiatorBridge {
    id: InitiatorId,
    name: String,
    wiring: PortWiring,
    space: Arc<AddressSpace>,
    target: RwLock<Option<BoundTarget>>,
    /// Serializes regular accesses; the cell counts nesting on the owning thread
    port_lock: ReentrantMutex<Cell<u32>>,
    regions: RwLock<BTreeMap<u64, Arc<TranslatingRegion>>>,
    pending_ranges: Arc<Mutex<Vec<AddrRange>>>,
    /// Bumped by every invalidation
    fill_epoch: Mutex<u64>,
    finished: AtomicBool,
    counters: PortCounters,
}

impl InitiatorBridge {
    pub fn new(id: InitiatorId, name: impl Into<String>, wiring: PortWiring) -> Arc<Self> {
        let space = wiring.dmi.register_initiator(id);
        Arc::new(Self {
            id,
            name: name.into(),
            wiring,
            space,
            target: RwLock::new(None),
            port_lock: ReentrantMutex::new(Cell::new(0)),
            regions: RwLock::new(BTreeMap::new()),
            pending_ranges: Arc::new(Mutex::new(Vec::new())),
            fill_epoch: Mutex::new(0),
            finished: AtomicBool::new(false),
            counters: PortCounters::default(),
        })
    }

    pub fn id(&self) -> InitiatorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The port's flat aliases
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn stats(&self) -> PortStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn fill_epoch(&self) -> u64 {
        *self.fill_epoch.lock()
    }

    /// Connect the port to its downstream target
    pub fn bind(self: &Arc<Self>, target: Arc<dyn Target>) -> Result<()> {
        let caps = target.capabilities();
        if caps.contains(Capabilities::NONBLOCKING) && !caps.contains(Capabilities::TRANSPORT) {
            error!("Port '{}': target only answers on the non-blocking path", self.name);
            return Err(ProtocolError::BackwardPath {
                port: self.name.clone(),
            }
            .into());
        }
        if !self.can_accept(caps) {
            return Err(ProtocolError::IncompatibleEndpoint {
                port: self.name.clone(),
                reason: format!("target offers {:?} without blocking transport", caps),
            }
            .into());
        }

        if caps.contains(Capabilities::DIRECT_MEMORY) {
            let sink: Weak<dyn InvalidationSink> = Arc::downgrade(self) as Weak<dyn InvalidationSink>;
            target.attach_backward(sink);
        }
        debug!("Port '{}' bound to target offering {:?}", self.name, caps);
        *self.target.write() = Some(BoundTarget { target, caps });
        Ok(())
    }

    fn bound(&self) -> Result<BoundTarget> {
        self.target
            .read()
            .clone()
            .ok_or_else(|| ProtocolError::Unbound(self.name.clone()).into())
    }

    /// Engine-side load: flat alias, then translating region, then transaction
    pub fn read(&self, ctx: &mut EngineContext<'_>, addr: u64, buf: &mut [u8], attrs: AccessAttrs) -> Result<AccessResult> {
        self.memory_access(ctx, Command::Read, addr, buf, attrs)
    }

    /// Engine-side store: flat alias, then translating region, then transaction
    pub fn write(&self, ctx: &mut EngineContext<'_>, addr: u64, data: &[u8], attrs: AccessAttrs) -> Result<AccessResult> {
        let mut data = data.to_vec();
        self.memory_access(ctx, Command::Write, addr, &mut data, attrs)
    }

    fn memory_access(
        &self,
        ctx: &mut EngineContext<'_>,
        command: Command,
        addr: u64,
        data: &mut [u8],
        attrs: AccessAttrs,
    ) -> Result<AccessResult> {
        if attrs.exclusive || attrs.debug || self.is_finished() {
            return self.access(ctx, command, addr, data, attrs);
        }

        let hit = match command {
            Command::Read => self.space.read(ctx, addr, data),
            Command::Write => self.space.write(ctx, addr, data),
            Command::Ignore => false,
        };
        if hit {
            PortCounters::bump(&self.counters.fast_path);
            return Ok(AccessResult::Ok);
        }

        if let Some(region) = self.translating_region_for(addr) {
            return self.translated_access(ctx, &region, command, addr, data, attrs);
        }

        self.access(ctx, command, addr, data, attrs)
    }

    fn translated_access(
        &self,
        ctx: &mut EngineContext<'_>,
        region: &TranslatingRegion,
        command: Command,
        addr: u64,
        data: &mut [u8],
        attrs: AccessAttrs,
    ) -> Result<AccessResult> {
        let needed = match command {
            Command::Write => AccessFlags::WRITE,
            _ => AccessFlags::READ,
        };
        let entry = self.translate(ctx, region, addr, needed)?;
        if !entry.access.contains(needed) {
            trace!("Translation at 0x{:x} denies {:?}", addr, needed);
            return Ok(AccessResult::Error);
        }

        let out = entry.translate(addr);
        let hit = match (entry.target, command) {
            (TranslationTarget::Nested, Command::Read) => region.nested_read(ctx, out, data),
            (TranslationTarget::Nested, Command::Write) => region.nested_write(ctx, out, data),
            (TranslationTarget::System, Command::Read) => region.space().read(ctx, out, data),
            (TranslationTarget::System, Command::Write) => region.space().write(ctx, out, data),
            (_, Command::Ignore) => false,
        };
        if hit {
            PortCounters::bump(&self.counters.fast_path);
            return Ok(AccessResult::Ok);
        }

        // No direct pointer behind the translation: the target translates the
        // original address itself.
        self.access(ctx, command, addr, data, attrs)
    }

    /// Issue a transaction for a raw engine access
    pub fn access(
        &self,
        ctx: &mut EngineContext<'_>,
        command: Command,
        addr: u64,
        data: &mut [u8],
        attrs: AccessAttrs,
    ) -> Result<AccessResult> {
        if self.is_finished() {
            return Ok(AccessResult::Error);
        }
        let bound = self.bound()?;

        if attrs.exclusive {
            PortCounters::bump(&self.counters.direct);
            return self.direct_access(&bound, command, addr, data);
        }

        let guard = match self.port_lock.try_lock() {
            Some(guard) => guard,
            None => ctx.unlocked(|| self.port_lock.lock()),
        };
        let depth = guard.get() + 1;
        guard.set(depth);

        let result = if depth > 1 {
            trace!("Reentrant access at 0x{:x} on port '{}'", addr, self.name);
            PortCounters::bump(&self.counters.reentrant);
            PortCounters::bump(&self.counters.direct);
            self.direct_access(&bound, command, addr, data)
        } else if attrs.debug {
            self.debug_access(ctx, &bound, command, addr, data)
        } else {
            self.regular_access(ctx, &bound, command, addr, data)
        };

        guard.set(depth - 1);
        result
    }

    fn build_transaction(&self, command: Command, addr: u64, data: &[u8]) -> Transaction {
        let mut tx = Transaction::new(command, addr, data.len());
        if command == Command::Write {
            tx.data.copy_from_slice(data);
        }
        tx.initiator = Some(self.id);
        tx
    }

    fn complete(&self, tx: &Transaction, data: &mut [u8]) -> Result<AccessResult> {
        if tx.data.len() != data.len() {
            error!(
                "Port '{}': transaction at 0x{:x} came back with {} bytes, expected {}",
                self.name,
                tx.address,
                tx.data.len(),
                data.len()
            );
            return Err(ProtocolError::LengthMismatch {
                addr: tx.address,
                expected: data.len(),
                actual: tx.data.len(),
            }
            .into());
        }
        match tx.status {
            ResponseStatus::Ok => {
                if tx.command == Command::Read {
                    data.copy_from_slice(&tx.data);
                }
                Ok(AccessResult::Ok)
            }
            ResponseStatus::AddressError => Ok(AccessResult::DecodeError),
            ResponseStatus::GenericError => Ok(AccessResult::Error),
            ResponseStatus::CommandError => {
                error!("Port '{}': command error at 0x{:x}", self.name, tx.address);
                Err(ProtocolError::CommandError { addr: tx.address }.into())
            }
            ResponseStatus::Incomplete => {
                error!("Port '{}': incomplete response at 0x{:x}", self.name, tx.address);
                Err(ProtocolError::IncompleteResponse { addr: tx.address }.into())
            }
        }
    }

    /// Issue the transaction on the calling thread without giving up the
    /// engine lock and without touching any cache
    fn direct_access(&self, bound: &BoundTarget, command: Command, addr: u64, data: &mut [u8]) -> Result<AccessResult> {
        let mut tx = self.build_transaction(command, addr, data);
        tx.exclusive = true;
        let mut delay = self.wiring.keeper.local_offset();
        bound.target.transport(&mut tx, &mut delay);
        self.wiring.keeper.set_local_offset(delay);
        self.complete(&tx, data)
    }

    fn debug_access(
        &self,
        ctx: &mut EngineContext<'_>,
        bound: &BoundTarget,
        command: Command,
        addr: u64,
        data: &mut [u8],
    ) -> Result<AccessResult> {
        PortCounters::bump(&self.counters.debug);
        let tx = self.build_transaction(command, addr, data);
        let target = bound.target.clone();
        let kernel = self.wiring.kernel.clone();

        let outcome = ctx.unlocked(move || {
            run_on_kernel(kernel.as_ref(), move || {
                let mut tx = tx;
                let handled = target.transport_dbg(&mut tx);
                (tx, handled)
            })
        });
        match outcome {
            Some((tx, handled)) if handled == tx.len() => self.complete(&tx, data),
            Some((tx, _)) if tx.status == ResponseStatus::Ok => Ok(AccessResult::Error),
            Some((tx, _)) => self.complete(&tx, data),
            None => Ok(AccessResult::Error),
        }
    }

    fn regular_access(
        &self,
        ctx: &mut EngineContext<'_>,
        bound: &BoundTarget,
        command: Command,
        addr: u64,
        data: &mut [u8],
    ) -> Result<AccessResult> {
        PortCounters::bump(&self.counters.transactions);
        let tx = self.build_transaction(command, addr, data);
        let target = bound.target.clone();
        let kernel = self.wiring.kernel.clone();
        let offset = self.wiring.keeper.local_offset();
        let epoch = self.fill_epoch();

        let outcome = ctx.unlocked(move || {
            run_on_kernel(kernel.as_ref(), move || {
                let mut tx = tx;
                let mut delay: SimTime = offset;
                target.transport(&mut tx, &mut delay);
                (tx, delay)
            })
        });
        let (tx, delay) = match outcome {
            Some(outcome) => outcome,
            None => {
                warn!("Port '{}': kernel gone during access at 0x{:x}", self.name, addr);
                return Ok(AccessResult::Error);
            }
        };

        self.wiring.keeper.set_local_offset(delay);
        let result = self.complete(&tx, data)?;

        if result == AccessResult::Ok
            && tx.dmi_allowed
            && bound.caps.contains(Capabilities::DIRECT_MEMORY)
        {
            self.check_dmi_hint(ctx, bound, command, addr, epoch)?;
        }

        if self.wiring.keeper.needs_sync() {
            self.wiring.exit_request.store(true, Ordering::Release);
        }
        Ok(result)
    }

    /// Act on a target's hint that `addr` may be accessed directly. `epoch`
    /// is the fill epoch from before the transaction was issued.
    fn check_dmi_hint(
        &self,
        ctx: &mut EngineContext<'_>,
        bound: &BoundTarget,
        command: Command,
        addr: u64,
        epoch: u64,
    ) -> Result<()> {
        let access = match command {
            Command::Write => AccessFlags::WRITE,
            _ => AccessFlags::READ,
        };
        match bound.target.direct_mem(addr, access) {
            DirectMemReply::Denied => {
                trace!("Direct access at 0x{:x} denied", addr);
            }
            DirectMemReply::Granted(desc) => {
                let current = self.fill_epoch.lock();
                if *current != epoch {
                    debug!("Port '{}': grant for 0x{:x} raced an invalidation, dropped", self.name, addr);
                    return Ok(());
                }
                self.wiring.dmi.get_or_create_alias(ctx, self.id, &desc)?;
            }
            DirectMemReply::Translated { window, .. } => {
                self.ensure_translating_region(ctx, window)?;
            }
        }
        Ok(())
    }

    /// The translating region covering exactly `window`, created on first use
    pub fn ensure_translating_region(&self, ctx: &EngineContext<'_>, window: AddrRange) -> Result<Arc<TranslatingRegion>> {
        let mut regions = self.regions.write();
        if let Some(existing) = regions.get(&window.start) {
            if existing.window() == window {
                return Ok(existing.clone());
            }
        }
        if let Some(conflict) = regions
            .values()
            .find(|region| region.window().overlaps(window.start, window.end))
        {
            error!(
                "Port '{}': translating window [0x{:x}, 0x{:x}] overlaps an existing one",
                self.name, window.start, window.end
            );
            return Err(TranslationError::Overlap {
                start: window.start,
                end: window.end,
                existing_start: conflict.window().start,
                existing_end: conflict.window().end,
            }
            .into());
        }

        // Flat aliases in the window bypass the translator from now on
        self.wiring.dmi.invalidate_for(ctx, self.id, window.start, window.end);

        let id = InitiatorId(self.wiring.ids.fetch_add(1, Ordering::Relaxed));
        let space = self.wiring.dmi.register_initiator(id);
        let region = Arc::new(TranslatingRegion::new(id, window, space));
        regions.insert(window.start, region.clone());
        info!(
            "Port '{}': translating region [0x{:x}, 0x{:x}]",
            self.name, window.start, window.end
        );
        Ok(region)
    }

    /// Translating region covering `addr`
    pub fn translating_region_for(&self, addr: u64) -> Option<Arc<TranslatingRegion>> {
        self.regions
            .read()
            .range(..=addr)
            .next_back()
            .filter(|(_, region)| region.window().contains(addr))
            .map(|(_, region)| region.clone())
    }

    pub fn translating_regions(&self) -> Vec<Arc<TranslatingRegion>> {
        self.regions.read().values().cloned().collect()
    }

    /// Translate `addr` inside `region`, serving from the cache when possible
    pub fn translate(
        &self,
        ctx: &EngineContext<'_>,
        region: &TranslatingRegion,
        addr: u64,
        access: AccessFlags,
    ) -> Result<TranslationEntry> {
        if self.is_finished() {
            return Err(BridgeError::TornDown(self.name.clone()));
        }

        if let Some(hit) = region.lookup(addr) {
            if self.wiring.verify_translations {
                let (fresh, _) = self.compute_translation(region, addr, access)?;
                debug_assert_eq!(hit, fresh, "stale translation cached for 0x{:x}", addr);
                if hit != fresh {
                    warn!("Port '{}': cached translation for 0x{:x} disagrees", self.name, addr);
                }
            }
            return Ok(hit);
        }

        let epoch = self.fill_epoch();
        let (entry, fill) = self.compute_translation(region, addr, access)?;

        let current = self.fill_epoch.lock();
        if *current != epoch {
            // Usable once, never cached: the target may already have revoked it
            debug!("Port '{}': translation of 0x{:x} raced an invalidation", self.name, addr);
            return Ok(entry);
        }
        match fill {
            Fill::Nested(desc) => region.add_nested(desc)?,
            Fill::Alias(desc) => {
                self.wiring.dmi.get_or_create_alias(ctx, region.id(), &desc)?;
            }
            Fill::Nothing => {}
        }
        region.insert(entry);
        drop(current);
        trace!(
            "Translated 0x{:x} -> 0x{:x} ({:?}, mask 0x{:x})",
            addr,
            entry.translate(addr),
            entry.target,
            entry.mask
        );
        Ok(entry)
    }

    /// Ask the target how `addr` translates. Installs nothing.
    fn compute_translation(
        &self,
        region: &TranslatingRegion,
        addr: u64,
        access: AccessFlags,
    ) -> Result<(TranslationEntry, Fill)> {
        let bound = self.bound()?;
        let window = region.window();

        let computed = match bound.target.direct_mem(addr, access) {
            DirectMemReply::Translated {
                translated,
                mask,
                access,
                grant,
                ..
            } => match grant {
                Some(desc) => (
                    TranslationEntry::new(addr, TranslationTarget::Nested, translated, mask, access),
                    Fill::Nested(desc),
                ),
                None => (
                    TranslationEntry::new(addr, TranslationTarget::System, translated, mask, access),
                    Fill::Nothing,
                ),
            },
            DirectMemReply::Granted(desc) if desc.contains(addr) => {
                let mask = aligned_block_mask(addr, desc.start.max(window.start), desc.end.min(window.end));
                (
                    TranslationEntry::new(addr, TranslationTarget::System, addr, mask, desc.access),
                    Fill::Alias(desc),
                )
            }
            DirectMemReply::Granted(desc) => {
                warn!(
                    "Port '{}': grant [0x{:x}, 0x{:x}] does not cover 0x{:x}",
                    self.name, desc.start, desc.end, addr
                );
                (self.page_entry(window, addr), Fill::Nothing)
            }
            DirectMemReply::Denied => (self.page_entry(window, addr), Fill::Nothing),
        };
        Ok(computed)
    }

    /// Identity entry for the minimum page around `addr`, or for `addr`
    /// alone when that page sticks out of the window
    fn page_entry(&self, window: AddrRange, addr: u64) -> TranslationEntry {
        let page = self.wiring.page;
        let mask = if page.align_down(addr) >= window.start && (addr | page.mask()) <= window.end {
            page.mask()
        } else {
            0
        };
        TranslationEntry::new(addr, TranslationTarget::System, addr, mask, AccessFlags::READ_WRITE)
    }

    /// Drop every translation and alias of this port
    pub fn reset(&self, ctx: &EngineContext<'_>) {
        let regions: Vec<Arc<TranslatingRegion>> = std::mem::take(&mut *self.regions.write())
            .into_values()
            .collect();
        for region in &regions {
            region.clear();
            self.wiring.dmi.unregister_initiator(ctx, region.id());
        }
        self.pending_ranges.lock().clear();
        let removed = self.wiring.dmi.remove_initiator_aliases(ctx, self.id);
        debug!(
            "Port '{}' reset: {} regions, {} aliases dropped",
            self.name,
            regions.len(),
            removed
        );
    }

    /// Mark the port torn down. Later translations fail and accesses error out.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Release everything the port holds in the region manager
    pub fn teardown(&self, ctx: &EngineContext<'_>) {
        self.reset(ctx);
        self.wiring.dmi.unregister_initiator(ctx, self.id);
    }
}

impl Endpoint for InitiatorBridge {
    fn capabilities(&self) -> Capabilities {
        Capabilities::INVALIDATE
    }

    fn can_accept(&self, offered: Capabilities) -> bool {
        offered.contains(Capabilities::TRANSPORT)
    }
}

impl InvalidationSink for InitiatorBridge {
    fn invalidate_direct_mem(&self, start: u64, end: u64) {
        if self.is_finished() {
            return;
        }
        PortCounters::bump(&self.counters.invalidations);

        // Translation entries live behind their own locks and can go right away
        {
            let mut epoch = self.fill_epoch.lock();
            *epoch += 1;
            for region in self.regions.read().values() {
                if region.is_affected_by(start, end) {
                    region.purge(start, end);
                }
            }
        }

        // Aliases are engine-visible: remove them on the native context
        self.pending_ranges.lock().push(AddrRange::new(start, end));
        let pending = self.pending_ranges.clone();
        let dmi = self.wiring.dmi.clone();
        let queued = self.wiring.native.push(move |ctx: &mut EngineContext<'_>| {
            let ranges = std::mem::take(&mut *pending.lock());
            for range in ranges {
                dmi.invalidate(ctx, range.start, range.end);
            }
        });
        if !queued {
            trace!("Port '{}': invalidation dropped, CPU finished", self.name);
        }
    }
}
