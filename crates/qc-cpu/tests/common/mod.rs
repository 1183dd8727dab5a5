//! Shared test doubles: memory targets and a scripted core

#![allow(dead_code)]

use parking_lot::Mutex;
use qc_core::context::EngineContext;
use qc_core::error::Result;
use qc_core::kernel::SimTime;
use qc_core::protocol::{
    AccessFlags, AddrRange, Capabilities, Command, DirectMemReply, DmiDescriptor, Endpoint,
    HostPtr, InvalidationSink, ResponseStatus, Target, Transaction,
};
use qc_cpu::{AccessAttrs, AccessResult, CpuCore, ExitReason, InitiatorBridge, LoopExit, RunBudget};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

type SinkSlot = Mutex<Option<Weak<dyn InvalidationSink>>>;

fn notify_sink(slot: &SinkSlot, start: u64, end: u64) {
    let sink = slot.lock().as_ref().and_then(Weak::upgrade);
    if let Some(sink) = sink {
        sink.invalidate_direct_mem(start, end);
    }
}

/// RAM granting direct access to all of itself, or page by page
pub struct RamTarget {
    base: u64,
    size: u64,
    host: HostPtr,
    dmi: bool,
    page_grants: bool,
    latency: SimTime,
    sink: SinkSlot,
    transactions: AtomicU64,
    revoke_next: AtomicBool,
}

impl RamTarget {
    pub fn new(base: u64, size: u64) -> Self {
        // Leaked so the pointer outlives every alias made from it
        let memory: &'static mut [u8] = Box::leak(vec![0u8; size as usize].into_boxed_slice());
        Self {
            base,
            size,
            host: HostPtr::new(memory.as_mut_ptr()).unwrap(),
            dmi: true,
            page_grants: false,
            latency: 0,
            sink: Mutex::new(None),
            transactions: AtomicU64::new(0),
            revoke_next: AtomicBool::new(false),
        }
    }

    pub fn without_dmi(mut self) -> Self {
        self.dmi = false;
        self
    }

    pub fn with_page_grants(mut self) -> Self {
        self.page_grants = true;
        self
    }

    pub fn with_latency(mut self, latency: SimTime) -> Self {
        self.latency = latency;
        self
    }

    pub fn range(&self) -> AddrRange {
        AddrRange::with_size(self.base, self.size)
    }

    pub fn descriptor(&self) -> DmiDescriptor {
        DmiDescriptor::new(self.base, self.base + self.size - 1, AccessFlags::READ_WRITE, self.host)
    }

    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    pub fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.host.add((addr - self.base) as usize), out.as_mut_ptr(), len);
        }
        out
    }

    /// Revoke direct access to `[start, end]` through the backward path
    pub fn invalidate(&self, start: u64, end: u64) {
        notify_sink(&self.sink, start, end);
    }

    /// Make the next direct memory request revoke the whole RAM before it
    /// answers with a grant
    pub fn revoke_during_next_request(&self) {
        self.revoke_next.store(true, Ordering::Release);
    }
}

impl Endpoint for RamTarget {
    fn capabilities(&self) -> Capabilities {
        if self.dmi {
            Capabilities::TRANSPORT | Capabilities::DEBUG | Capabilities::DIRECT_MEMORY
        } else {
            Capabilities::TRANSPORT | Capabilities::DEBUG
        }
    }
}

impl Target for RamTarget {
    fn transport(&self, tx: &mut Transaction, delay: &mut SimTime) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        let range = self.range();
        if !range.contains(tx.address) || !range.contains(tx.end()) {
            tx.status = ResponseStatus::AddressError;
            return;
        }
        let offset = (tx.address - self.base) as usize;
        unsafe {
            match tx.command {
                Command::Read => {
                    std::ptr::copy_nonoverlapping(self.host.add(offset), tx.data.as_mut_ptr(), tx.len())
                }
                Command::Write => {
                    std::ptr::copy_nonoverlapping(tx.data.as_ptr(), self.host.add(offset), tx.len())
                }
                Command::Ignore => {}
            }
        }
        tx.status = ResponseStatus::Ok;
        tx.dmi_allowed = self.dmi;
        *delay += self.latency;
    }

    fn direct_mem(&self, address: u64, _access: AccessFlags) -> DirectMemReply {
        if !self.dmi || !self.range().contains(address) {
            return DirectMemReply::Denied;
        }
        if self.revoke_next.swap(false, Ordering::AcqRel) {
            let range = self.range();
            notify_sink(&self.sink, range.start, range.end);
        }
        if !self.page_grants {
            return DirectMemReply::Granted(self.descriptor());
        }
        let start = address & !0xfff;
        let host = unsafe { HostPtr::new(self.host.add((start - self.base) as usize)).unwrap() };
        DirectMemReply::Granted(DmiDescriptor::new(start, start + 0xfff, AccessFlags::READ_WRITE, host))
    }

    fn attach_backward(&self, sink: Weak<dyn InvalidationSink>) {
        *self.sink.lock() = Some(sink);
    }
}

/// Device registers: no direct access, failures on demand
pub struct MmioTarget {
    range: AddrRange,
    regs: Mutex<Vec<u8>>,
    fail_with: Mutex<Option<ResponseStatus>>,
    accesses: AtomicU64,
}

impl MmioTarget {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            range: AddrRange::with_size(base, size),
            regs: Mutex::new(vec![0; size as usize]),
            fail_with: Mutex::new(None),
            accesses: AtomicU64::new(0),
        }
    }

    pub fn fail_with(&self, status: ResponseStatus) {
        *self.fail_with.lock() = Some(status);
    }

    pub fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }
}

impl Endpoint for MmioTarget {
    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSPORT
    }
}

impl Target for MmioTarget {
    fn transport(&self, tx: &mut Transaction, _delay: &mut SimTime) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        if let Some(status) = *self.fail_with.lock() {
            tx.status = status;
            return;
        }
        if !self.range.contains(tx.address) || !self.range.contains(tx.end()) {
            tx.status = ResponseStatus::AddressError;
            return;
        }
        let offset = (tx.address - self.range.start) as usize;
        let len = tx.len();
        let mut regs = self.regs.lock();
        match tx.command {
            Command::Read => tx.data.copy_from_slice(&regs[offset..offset + len]),
            Command::Write => regs[offset..offset + len].copy_from_slice(&tx.data),
            Command::Ignore => {}
        }
        tx.status = ResponseStatus::Ok;
    }
}

/// How a [`TranslatingTarget`] answers direct memory requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateMode {
    /// Translated, with a grant for the output memory
    Nested,
    /// Translated, output memory without a grant
    System,
    /// Identity mapping; the memory grants directly
    Passthrough,
    /// No direct access at all
    Opaque,
}

/// Translation hardware in front of a RAM: `window` maps linearly onto the RAM
pub struct TranslatingTarget {
    window: AddrRange,
    downstream: Arc<RamTarget>,
    mode: TranslateMode,
    sink: SinkSlot,
    revoke_next: AtomicBool,
}

impl TranslatingTarget {
    pub fn new(window: AddrRange, downstream: Arc<RamTarget>, mode: TranslateMode) -> Self {
        Self {
            window,
            downstream,
            mode,
            sink: Mutex::new(None),
            revoke_next: AtomicBool::new(false),
        }
    }

    pub fn window(&self) -> AddrRange {
        self.window
    }

    pub fn translate(&self, addr: u64) -> u64 {
        self.downstream.range().start + (addr - self.window.start)
    }

    pub fn invalidate(&self, start: u64, end: u64) {
        notify_sink(&self.sink, start, end);
    }

    /// Make the next direct memory request revoke the output page it
    /// translates to before answering
    pub fn revoke_during_next_request(&self) {
        self.revoke_next.store(true, Ordering::Release);
    }
}

impl Endpoint for TranslatingTarget {
    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSPORT | Capabilities::DIRECT_MEMORY
    }
}

impl Target for TranslatingTarget {
    fn transport(&self, tx: &mut Transaction, delay: &mut SimTime) {
        if !self.window.contains(tx.address) {
            tx.status = ResponseStatus::AddressError;
            return;
        }
        let original = tx.address;
        tx.address = self.translate(original);
        self.downstream.transport(tx, delay);
        tx.address = original;
        tx.dmi_allowed = self.mode != TranslateMode::Opaque;
    }

    fn direct_mem(&self, address: u64, _access: AccessFlags) -> DirectMemReply {
        if !self.window.contains(address) {
            return DirectMemReply::Denied;
        }
        let translated = self.translate(address);
        if self.revoke_next.swap(false, Ordering::AcqRel) {
            notify_sink(&self.sink, translated & !0xfff, translated | 0xfff);
        }
        match self.mode {
            TranslateMode::Nested => DirectMemReply::Translated {
                window: self.window,
                translated,
                mask: 0xfff,
                access: AccessFlags::READ_WRITE,
                grant: Some(self.downstream.descriptor()),
            },
            TranslateMode::System => DirectMemReply::Translated {
                window: self.window,
                translated,
                mask: 0xfff,
                access: AccessFlags::READ_WRITE,
                grant: None,
            },
            TranslateMode::Passthrough => self.downstream.direct_mem(address, AccessFlags::READ_WRITE),
            TranslateMode::Opaque => DirectMemReply::Denied,
        }
    }

    fn attach_backward(&self, sink: Weak<dyn InvalidationSink>) {
        *self.sink.lock() = Some(sink);
    }
}

/// One step of a [`ScriptCore`] program
#[derive(Debug, Clone)]
pub enum Op {
    Read { addr: u64, len: usize },
    Write { addr: u64, data: Vec<u8> },
    Tick(u64),
    Fault(String),
}

/// Outcome of one scripted access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub addr: u64,
    pub result: AccessResult,
    pub data: Vec<u8>,
}

/// Core running a fixed program, one tick per access; optionally spinning
/// until its deadline once the program is done
pub struct ScriptCore {
    ops: VecDeque<Op>,
    clock: u64,
    halted: bool,
    spin: bool,
    log: Arc<Mutex<Vec<AccessRecord>>>,
    resets: Arc<AtomicU32>,
}

impl ScriptCore {
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            ops: ops.into(),
            clock: 0,
            halted: false,
            spin: false,
            log: Arc::new(Mutex::new(Vec::new())),
            resets: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn spinning() -> Self {
        let mut core = Self::new(Vec::new());
        core.spin = true;
        core
    }

    pub fn log(&self) -> Arc<Mutex<Vec<AccessRecord>>> {
        self.log.clone()
    }

    pub fn resets(&self) -> Arc<AtomicU32> {
        self.resets.clone()
    }
}

impl CpuCore for ScriptCore {
    fn run(
        &mut self,
        ctx: &mut EngineContext<'_>,
        port: &InitiatorBridge,
        budget: &RunBudget<'_>,
    ) -> Result<LoopExit> {
        loop {
            if budget.exit_requested() {
                return Ok(LoopExit::new(ExitReason::Kicked));
            }
            if self.clock >= budget.deadline {
                return Ok(LoopExit::new(ExitReason::QuantumExpired));
            }
            match self.ops.pop_front() {
                Some(Op::Read { addr, len }) => {
                    let mut buf = vec![0u8; len];
                    let result = port.read(ctx, addr, &mut buf, AccessAttrs::default())?;
                    self.log.lock().push(AccessRecord { addr, result, data: buf });
                    self.clock += 1;
                }
                Some(Op::Write { addr, data }) => {
                    let result = port.write(ctx, addr, &data, AccessAttrs::default())?;
                    self.log.lock().push(AccessRecord { addr, result, data });
                    self.clock += 1;
                }
                Some(Op::Tick(ticks)) => self.clock += ticks,
                Some(Op::Fault(message)) => return Ok(LoopExit::new(ExitReason::Fault(message))),
                None if self.spin => self.clock = budget.deadline,
                None => return Ok(LoopExit::new(ExitReason::Idle)),
            }
        }
    }

    fn has_work(&self, _irq: bool) -> bool {
        !self.halted && (self.spin || !self.ops.is_empty())
    }

    fn clock(&self) -> u64 {
        self.clock
    }

    fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    fn reset(&mut self) {
        self.clock = 0;
        self.resets.fetch_add(1, Ordering::Relaxed);
    }
}
