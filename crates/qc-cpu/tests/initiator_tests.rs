//! Initiator bridge access paths, aliasing and translation caching

mod common;

use common::{MmioTarget, RamTarget, TranslateMode, TranslatingTarget};
use parking_lot::Mutex;
use qc_core::config::SyncPolicy;
use qc_core::context::{EngineLock, NativeQueue};
use qc_core::error::{BridgeError, Result};
use qc_core::kernel::{EventKernel, Kernel, SimTime};
use qc_core::error::ProtocolError;
use qc_core::protocol::{
    AccessFlags, AddrRange, Capabilities, Command, DirectMemReply, Endpoint, InitiatorId,
    InvalidationSink, ResponseStatus, Target, Transaction,
};
use qc_core::quantum::{QuantumKeeper, TickRatio};
use qc_cpu::{AccessAttrs, AccessResult, InitiatorBridge, PortWiring};
use qc_memory::{DmiManager, PageGeometry, TranslationTarget};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

struct Rig {
    kernel: Arc<EventKernel>,
    lock: Arc<EngineLock>,
    dmi: Arc<DmiManager>,
    keeper: Arc<QuantumKeeper>,
    native: NativeQueue,
    exit_request: Arc<AtomicBool>,
    port: Arc<InitiatorBridge>,
}

fn rig_with_limit(target: Arc<dyn Target>, limit: usize) -> Rig {
    common::init_tracing();
    let kernel = EventKernel::new();
    let lock = Arc::new(EngineLock::new());
    let dmi = Arc::new(DmiManager::new(limit));
    let keeper = Arc::new(QuantumKeeper::new(
        1000,
        TickRatio::new(0),
        SyncPolicy::Cooperative,
        kernel.clone(),
    ));
    let native = NativeQueue::new();
    let exit_request = Arc::new(AtomicBool::new(false));
    let port = InitiatorBridge::new(
        InitiatorId(0),
        "cpu0.mem",
        PortWiring {
            kernel: kernel.clone(),
            keeper: keeper.clone(),
            dmi: dmi.clone(),
            native: native.clone(),
            exit_request: exit_request.clone(),
            ids: Arc::new(AtomicU32::new(1)),
            page: PageGeometry::new(12),
            verify_translations: true,
        },
    );
    port.bind(target).unwrap();
    Rig {
        kernel,
        lock,
        dmi,
        keeper,
        native,
        exit_request,
        port,
    }
}

fn rig(target: Arc<dyn Target>) -> Rig {
    rig_with_limit(target, 250)
}

impl Rig {
    fn read(&self, addr: u64, len: usize) -> (AccessResult, Vec<u8>) {
        let mut ctx = self.lock.enter();
        let mut buf = vec![0u8; len];
        let result = self.port.read(&mut ctx, addr, &mut buf, AccessAttrs::default()).unwrap();
        (result, buf)
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<AccessResult> {
        let mut ctx = self.lock.enter();
        self.port.write(&mut ctx, addr, data, AccessAttrs::default())
    }

    fn drain(&self) -> usize {
        let mut ctx = self.lock.enter();
        self.native.drain(&mut ctx)
    }
}

#[test]
fn test_grant_installs_alias_for_fast_path() {
    let ram = Arc::new(RamTarget::new(0x1000, 0x1000));
    let rig = rig(ram.clone());

    assert_eq!(rig.write(0x1010, &[1, 2, 3, 4]).unwrap(), AccessResult::Ok);
    assert_eq!(ram.transactions(), 1);
    assert_eq!(rig.dmi.alias_count(InitiatorId(0)), 1);

    let (result, data) = rig.read(0x1010, 4);
    assert_eq!(result, AccessResult::Ok);
    assert_eq!(data, vec![1, 2, 3, 4]);
    assert_eq!(ram.transactions(), 1);

    let stats = rig.port.stats();
    assert_eq!(stats.transactions, 1);
    assert_eq!(stats.fast_path, 1);
}

#[test]
fn test_partial_invalidation_then_fresh_grant() {
    let ram = Arc::new(RamTarget::new(0x1000, 0x1000));
    let rig = rig(ram.clone());

    rig.write(0x1000, &[0x5a]).unwrap();
    let after_first = rig.dmi.alias_count(InitiatorId(0));
    assert_eq!(after_first, 1);

    // Removal is queued for the native context
    ram.invalidate(0x1500, 0x15ff);
    assert!(rig.native.has_pending());
    assert_eq!(rig.drain(), 1);
    assert_eq!(rig.dmi.alias_count(InitiatorId(0)), 0);
    assert_eq!(rig.dmi.region_count(), 0);

    // The next access at 0x1000 goes downstream again and re-grants
    let (result, data) = rig.read(0x1000, 1);
    assert_eq!(result, AccessResult::Ok);
    assert_eq!(data, vec![0x5a]);
    assert_eq!(ram.transactions(), 2);
    assert_eq!(rig.dmi.alias_count(InitiatorId(0)), after_first);
}

#[test]
fn test_address_error_is_not_cached() {
    let mmio = Arc::new(MmioTarget::new(0x4000, 0x100));
    let rig = rig(mmio.clone());

    let (result, _) = rig.read(0x9000, 4);
    assert_eq!(result, AccessResult::DecodeError);
    assert_eq!(rig.dmi.total_aliases(), 0);

    assert_eq!(rig.write(0x4000, &[7, 0, 0, 0]).unwrap(), AccessResult::Ok);
    let (result, data) = rig.read(0x4000, 4);
    assert_eq!(result, AccessResult::Ok);
    assert_eq!(data, vec![7, 0, 0, 0]);
    assert_eq!(mmio.accesses(), 3);
}

#[test]
fn test_protocol_violations_are_fatal() {
    let mmio = Arc::new(MmioTarget::new(0x4000, 0x100));
    let rig = rig(mmio.clone());

    mmio.fail_with(ResponseStatus::GenericError);
    assert_eq!(rig.write(0x4000, &[1]).unwrap(), AccessResult::Error);

    mmio.fail_with(ResponseStatus::CommandError);
    let err = rig.write(0x4000, &[1]).unwrap_err();
    assert!(err.is_fatal());

    mmio.fail_with(ResponseStatus::Incomplete);
    let err = rig.write(0x4000, &[1]).unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn test_exclusive_access_bypasses_caches() {
    let ram = Arc::new(RamTarget::new(0x1000, 0x1000));
    let rig = rig(ram.clone());

    let mut ctx = rig.lock.enter();
    let result = rig
        .port
        .write(&mut ctx, 0x1000, &[9; 8], AccessAttrs::exclusive())
        .unwrap();
    assert_eq!(result, AccessResult::Ok);
    drop(ctx);

    assert_eq!(rig.dmi.total_aliases(), 0);
    assert_eq!(rig.port.stats().direct, 1);
    assert_eq!(ram.peek(0x1000, 8), vec![9; 8]);
}

#[test]
fn test_debug_access_skips_caches() {
    let ram = Arc::new(RamTarget::new(0x1000, 0x1000));
    let rig = rig(ram.clone());

    let mut ctx = rig.lock.enter();
    rig.port.write(&mut ctx, 0x1100, &[3, 4], AccessAttrs::debug()).unwrap();
    let mut buf = [0u8; 2];
    let result = rig.port.read(&mut ctx, 0x1100, &mut buf, AccessAttrs::debug()).unwrap();
    drop(ctx);

    assert_eq!(result, AccessResult::Ok);
    assert_eq!(buf, [3, 4]);
    assert_eq!(rig.dmi.total_aliases(), 0);
    assert_eq!(rig.port.stats().debug, 2);
}

/// Device whose register read triggers a second access through the same port
struct EchoDevice {
    lock: Arc<EngineLock>,
    port: Mutex<Option<Weak<InitiatorBridge>>>,
    inner: Mutex<Option<AccessResult>>,
}

impl Endpoint for EchoDevice {
    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSPORT
    }
}

impl Target for EchoDevice {
    fn transport(&self, tx: &mut Transaction, _delay: &mut SimTime) {
        tx.status = ResponseStatus::Ok;
        if tx.address != 0x100 {
            return;
        }
        let port = self.port.lock().as_ref().and_then(Weak::upgrade);
        if let Some(port) = port {
            let mut ctx = self.lock.enter();
            let mut buf = [0u8; 4];
            let result = port
                .access(&mut ctx, Command::Read, 0x200, &mut buf, AccessAttrs::default())
                .unwrap();
            *self.inner.lock() = Some(result);
        }
    }
}

#[test]
fn test_reentrant_access_takes_direct_path() {
    common::init_tracing();
    let kernel = EventKernel::new();
    let lock = Arc::new(EngineLock::new());
    let device = Arc::new(EchoDevice {
        lock: lock.clone(),
        port: Mutex::new(None),
        inner: Mutex::new(None),
    });
    let dmi = Arc::new(DmiManager::new(250));
    let port = InitiatorBridge::new(
        InitiatorId(0),
        "cpu0.mem",
        PortWiring {
            kernel: kernel.clone(),
            keeper: Arc::new(QuantumKeeper::new(1000, TickRatio::new(0), SyncPolicy::Cooperative, kernel.clone())),
            dmi,
            native: NativeQueue::new(),
            exit_request: Arc::new(AtomicBool::new(false)),
            ids: Arc::new(AtomicU32::new(1)),
            page: PageGeometry::new(12),
            verify_translations: true,
        },
    );
    port.bind(device.clone()).unwrap();
    *device.port.lock() = Some(Arc::downgrade(&port));

    let mut ctx = lock.enter();
    let mut buf = [0u8; 4];
    let result = port.read(&mut ctx, 0x100, &mut buf, AccessAttrs::default()).unwrap();
    drop(ctx);

    assert_eq!(result, AccessResult::Ok);
    assert_eq!(*device.inner.lock(), Some(AccessResult::Ok));
    let stats = port.stats();
    assert_eq!(stats.transactions, 1);
    assert_eq!(stats.reentrant, 1);
    assert!(kernel.is_kernel_thread());
}

#[test]
fn test_alias_ceiling_is_fatal() {
    let ram = Arc::new(RamTarget::new(0x10000, 0x10000).with_page_grants());
    let rig = rig_with_limit(ram.clone(), 2);

    rig.write(0x10000, &[1]).unwrap();
    rig.write(0x11000, &[1]).unwrap();
    let err = rig.write(0x12000, &[1]).unwrap_err();
    assert!(matches!(err, BridgeError::Capacity(_)));
    assert!(err.is_fatal());
    assert!(err.to_string().contains("translat"));
}

#[test]
fn test_local_time_feedback_requests_exit() {
    let ram = Arc::new(RamTarget::new(0x1000, 0x1000).with_latency(2500));
    let rig = rig(ram);

    rig.write(0x1000, &[1]).unwrap();
    assert_eq!(rig.keeper.local_offset(), 2500);
    assert!(rig.keeper.needs_sync());
    assert!(rig.exit_request.load(Ordering::Acquire));
}

fn window() -> AddrRange {
    AddrRange::with_size(0x10_0000, 0x10_0000)
}

#[test]
fn test_nested_translation_is_cached_and_direct() {
    let ram = Arc::new(RamTarget::new(0x8000_0000, 0x10_0000));
    let iommu = Arc::new(TranslatingTarget::new(window(), ram.clone(), TranslateMode::Nested));
    let rig = rig(iommu.clone());

    // A plain access discovers the translating window
    assert_eq!(rig.write(0x10_0010, &[1, 2, 3, 4]).unwrap(), AccessResult::Ok);
    let region = rig.port.translating_region_for(0x10_0010).unwrap();
    assert_eq!(region.window(), window());
    assert_eq!(ram.peek(0x8000_0010, 4), vec![1, 2, 3, 4]);

    // Later accesses resolve through the nested grant
    let (result, data) = rig.read(0x10_0010, 4);
    assert_eq!(result, AccessResult::Ok);
    assert_eq!(data, vec![1, 2, 3, 4]);
    rig.write(0x10_0020, &[5]).unwrap();
    assert_eq!(ram.peek(0x8000_0020, 1), vec![5]);
    assert_eq!(ram.transactions(), 1);

    let ctx = rig.lock.enter();
    let entry = rig.port.translate(&ctx, &region, 0x10_0abc, AccessFlags::READ).unwrap();
    assert_eq!(entry.target, TranslationTarget::Nested);
    assert_eq!(entry.translate(0x10_0abc), iommu.translate(0x10_0abc));
    let again = rig.port.translate(&ctx, &region, 0x10_0abc, AccessFlags::READ).unwrap();
    assert_eq!(entry, again);
    assert!(region.cache_stats().hits >= 2);
}

#[test]
fn test_passthrough_translation_wraps_alias() {
    let ram = Arc::new(RamTarget::new(0x10_0000, 0x10_0000));
    let iommu = Arc::new(TranslatingTarget::new(window(), ram.clone(), TranslateMode::Passthrough));
    let rig = rig(iommu);

    let region = {
        let ctx = rig.lock.enter();
        rig.port.ensure_translating_region(&ctx, window()).unwrap()
    };

    assert_eq!(rig.write(0x10_2000, &[0xee; 4]).unwrap(), AccessResult::Ok);
    assert_eq!(ram.transactions(), 0);
    assert_eq!(ram.peek(0x10_2000, 4), vec![0xee; 4]);
    assert_eq!(rig.dmi.alias_count(region.id()), 1);
    assert_eq!(rig.dmi.alias_count(InitiatorId(0)), 0);

    let ctx = rig.lock.enter();
    let entry = rig.port.translate(&ctx, &region, 0x10_2000, AccessFlags::READ).unwrap();
    assert_eq!(entry.target, TranslationTarget::System);
    assert_eq!(entry.translate(0x10_2000), 0x10_2000);
    // The whole window is backed, so one entry covers it
    assert_eq!(entry.mask, 0xf_ffff);
}

#[test]
fn test_opaque_translation_synthesizes_page_entry() {
    let ram = Arc::new(RamTarget::new(0x10_0000, 0x10_0000).without_dmi());
    let iommu = Arc::new(TranslatingTarget::new(window(), ram.clone(), TranslateMode::Opaque));
    let rig = rig(iommu);

    let region = {
        let ctx = rig.lock.enter();
        rig.port.ensure_translating_region(&ctx, window()).unwrap()
    };

    rig.write(0x10_3010, &[1]).unwrap();
    let (result, data) = rig.read(0x10_3010, 1);
    assert_eq!(result, AccessResult::Ok);
    assert_eq!(data, vec![1]);

    // Both accesses went downstream; the second translation was a hit
    assert_eq!(ram.transactions(), 2);
    assert_eq!(region.entry_count(), 1);
    let stats = region.cache_stats();
    assert_eq!(stats.misses, 1);
    assert!(stats.hits >= 1);

    let ctx = rig.lock.enter();
    let entry = rig.port.translate(&ctx, &region, 0x10_3ff0, AccessFlags::READ).unwrap();
    assert_eq!(entry.mask, 0xfff);
    assert_eq!(entry.iova, 0x10_3000);
}

#[test]
fn test_invalidation_purges_translations() {
    let ram = Arc::new(RamTarget::new(0x8000_0000, 0x10_0000));
    let iommu = Arc::new(TranslatingTarget::new(window(), ram.clone(), TranslateMode::Nested));
    let rig = rig(iommu.clone());

    rig.write(0x10_0000, &[1]).unwrap();
    rig.read(0x10_1000, 1);
    rig.read(0x10_8000, 1);
    let region = rig.port.translating_region_for(0x10_0000).unwrap();
    assert_eq!(region.entry_count(), 2);

    // Invalidating inside the window drops overlapping entries only
    iommu.invalidate(0x10_1000, 0x10_1fff);
    assert_eq!(region.entry_count(), 1);
    assert!(region.lookup(0x10_8000).is_some());

    // Revoking the nested grant drops everything resolving into it
    rig.port.invalidate_direct_mem(0x8000_0000, 0x8000_0fff);
    assert_eq!(region.entry_count(), 0);
}

#[test]
fn test_translating_window_overlap_is_fatal() {
    let ram = Arc::new(RamTarget::new(0x8000_0000, 0x10_0000));
    let iommu = Arc::new(TranslatingTarget::new(window(), ram, TranslateMode::System));
    let rig = rig(iommu);

    let ctx = rig.lock.enter();
    let first = rig.port.ensure_translating_region(&ctx, window()).unwrap();
    let same = rig.port.ensure_translating_region(&ctx, window()).unwrap();
    assert!(Arc::ptr_eq(&first, &same));

    let err = rig
        .port
        .ensure_translating_region(&ctx, AddrRange::new(0x18_0000, 0x27_ffff))
        .unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn test_finished_port_short_circuits() {
    let ram = Arc::new(RamTarget::new(0x8000_0000, 0x10_0000));
    let iommu = Arc::new(TranslatingTarget::new(window(), ram, TranslateMode::Nested));
    let rig = rig(iommu.clone());

    rig.write(0x10_0000, &[1]).unwrap();
    let region = rig.port.translating_region_for(0x10_0000).unwrap();
    rig.port.finish();

    let (result, _) = rig.read(0x10_0000, 1);
    assert_eq!(result, AccessResult::Error);

    let ctx = rig.lock.enter();
    let err = rig.port.translate(&ctx, &region, 0x10_0000, AccessFlags::READ).unwrap_err();
    assert!(matches!(err, BridgeError::TornDown(_)));
    drop(ctx);

    iommu.invalidate(0x10_0000, 0x1f_ffff);
    assert!(!rig.native.has_pending());
}

#[test]
fn test_reset_drops_aliases_and_translations() {
    let ram = Arc::new(RamTarget::new(0x1000, 0x1000));
    let rig = rig(ram);

    rig.write(0x1000, &[1]).unwrap();
    let ctx = rig.lock.enter();
    rig.port.ensure_translating_region(&ctx, window()).unwrap();
    rig.port.reset(&ctx);

    assert_eq!(rig.dmi.total_aliases(), 0);
    assert!(rig.port.translating_regions().is_empty());
    assert!(rig.port.space().is_empty());
}

#[test]
fn test_bind_requires_transport() {
    struct DebugOnly;

    impl Endpoint for DebugOnly {
        fn capabilities(&self) -> Capabilities {
            Capabilities::DEBUG
        }
    }

    impl Target for DebugOnly {
        fn transport(&self, _tx: &mut Transaction, _delay: &mut SimTime) {}
    }

    let ram = Arc::new(RamTarget::new(0x1000, 0x1000));
    let rig = rig(ram);
    let err = rig.port.bind(Arc::new(DebugOnly)).unwrap_err();
    assert!(matches!(err, BridgeError::Protocol(_)));
    assert!(rig.kernel.is_kernel_thread());
}

#[test]
fn test_bind_rejects_nonblocking_only_target() {
    struct NonBlocking;

    impl Endpoint for NonBlocking {
        fn capabilities(&self) -> Capabilities {
            Capabilities::NONBLOCKING | Capabilities::DIRECT_MEMORY
        }
    }

    impl Target for NonBlocking {
        fn transport(&self, _tx: &mut Transaction, _delay: &mut SimTime) {}
    }

    let ram = Arc::new(RamTarget::new(0x1000, 0x1000));
    let rig = rig(ram);
    let err = rig.port.bind(Arc::new(NonBlocking)).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, BridgeError::Protocol(ProtocolError::BackwardPath { .. })));
}

#[test]
fn test_invalidation_during_translation_is_not_cached() {
    let ram = Arc::new(RamTarget::new(0x8000_0000, 0x10_0000));
    let iommu = Arc::new(TranslatingTarget::new(window(), ram.clone(), TranslateMode::Nested));
    let rig = rig(iommu.clone());
    let region = {
        let ctx = rig.lock.enter();
        rig.port.ensure_translating_region(&ctx, window()).unwrap()
    };

    // The target revokes the output page while answering the request
    iommu.revoke_during_next_request();
    {
        let ctx = rig.lock.enter();
        let entry = rig.port.translate(&ctx, &region, 0x10_0000, AccessFlags::READ).unwrap();
        assert_eq!(entry.target, TranslationTarget::Nested);
        assert!(region.lookup(0x10_0000).is_none());
        let mut buf = [0u8; 4];
        assert!(!region.nested_read(&ctx, 0x8000_0000, &mut buf));
    }

    // The access still completes, through the target
    let (result, _) = rig.read(0x10_0000, 4);
    assert_eq!(result, AccessResult::Ok);
    assert_eq!(ram.transactions(), 0);
    assert!(region.lookup(0x10_0000).is_some());

    let ctx = rig.lock.enter();
    let mut buf = [0u8; 4];
    assert!(region.nested_read(&ctx, 0x8000_0000, &mut buf));
}

#[test]
fn test_invalidation_during_grant_drops_alias() {
    let ram = Arc::new(RamTarget::new(0x1000, 0x1000));
    let rig = rig(ram.clone());

    ram.revoke_during_next_request();
    assert_eq!(rig.write(0x1000, &[1]).unwrap(), AccessResult::Ok);
    assert_eq!(rig.dmi.alias_count(InitiatorId(0)), 0);
    assert!(rig.port.space().is_empty());
    rig.drain();

    // Nothing raced this one
    rig.write(0x1000, &[2]).unwrap();
    assert_eq!(rig.dmi.alias_count(InitiatorId(0)), 1);
    assert_eq!(ram.transactions(), 2);
}

#[test]
fn test_resized_transaction_is_fatal() {
    struct Truncating;

    impl Endpoint for Truncating {
        fn capabilities(&self) -> Capabilities {
            Capabilities::TRANSPORT
        }
    }

    impl Target for Truncating {
        fn transport(&self, tx: &mut Transaction, _delay: &mut SimTime) {
            tx.data.truncate(1);
            tx.status = ResponseStatus::Ok;
        }
    }

    let rig = rig(Arc::new(Truncating));
    let mut ctx = rig.lock.enter();
    let mut buf = [0u8; 4];
    let err = rig.port.read(&mut ctx, 0x1000, &mut buf, AccessAttrs::default()).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        BridgeError::Protocol(ProtocolError::LengthMismatch { expected: 4, actual: 1, .. })
    ));
}

#[test]
fn test_grant_missing_address_falls_back_to_page_entry() {
    struct Misplaced(Arc<RamTarget>);

    impl Endpoint for Misplaced {
        fn capabilities(&self) -> Capabilities {
            Capabilities::TRANSPORT | Capabilities::DIRECT_MEMORY
        }
    }

    impl Target for Misplaced {
        fn transport(&self, tx: &mut Transaction, _delay: &mut SimTime) {
            tx.status = ResponseStatus::Ok;
        }

        fn direct_mem(&self, _address: u64, _access: AccessFlags) -> DirectMemReply {
            DirectMemReply::Granted(self.0.descriptor())
        }
    }

    let ram = Arc::new(RamTarget::new(0x8000_0000, 0x1000));
    let rig = rig(Arc::new(Misplaced(ram)));
    let ctx = rig.lock.enter();
    let region = rig.port.ensure_translating_region(&ctx, window()).unwrap();

    let entry = rig.port.translate(&ctx, &region, 0x10_3010, AccessFlags::READ).unwrap();
    assert_eq!(entry.target, TranslationTarget::System);
    assert_eq!(entry.mask, 0xfff);
    assert_eq!(entry.iova, 0x10_3000);
    assert_eq!(rig.dmi.alias_count(region.id()), 0);
}
