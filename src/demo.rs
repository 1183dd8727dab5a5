//! Demo platform: one RAM and cores that count in it

use parking_lot::Mutex;
use qc_core::context::EngineContext;
use qc_core::kernel::SimTime;
use qc_core::protocol::{
    AccessFlags, AddrRange, Capabilities, Command, DirectMemReply, DmiDescriptor, Endpoint,
    HostPtr, InvalidationSink, ResponseStatus, Target, Transaction,
};
use qc_cpu::{AccessAttrs, AccessResult, CpuCore, ExitReason, InitiatorBridge, LoopExit, RunBudget};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// RAM granting direct access to all of itself
pub struct DemoRam {
    range: AddrRange,
    host: HostPtr,
    sink: Mutex<Option<Weak<dyn InvalidationSink>>>,
}

impl DemoRam {
    pub fn new(base: u64, size: u64) -> anyhow::Result<Self> {
        let memory = Box::into_raw(vec![0u8; size as usize].into_boxed_slice());
        let host = HostPtr::new(memory.cast::<u8>())
            .ok_or_else(|| anyhow::anyhow!("could not allocate {} bytes of demo RAM", size))?;
        Ok(Self {
            range: AddrRange::with_size(base, size),
            host,
            sink: Mutex::new(None),
        })
    }

    /// Revoke every direct pointer into this RAM
    pub fn revoke(&self) {
        let sink = self.sink.lock().as_ref().and_then(Weak::upgrade);
        if let Some(sink) = sink {
            sink.invalidate_direct_mem(self.range.start, self.range.end);
        }
    }
}

impl Drop for DemoRam {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.host.as_ptr(), self.range.size() as usize);
        // SAFETY: allocated in `new` with exactly this length; no alias outlives the RAM
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl Endpoint for DemoRam {
    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSPORT | Capabilities::DEBUG | Capabilities::DIRECT_MEMORY
    }
}

impl Target for DemoRam {
    fn transport(&self, tx: &mut Transaction, delay: &mut SimTime) {
        if !self.range.contains(tx.address) || !self.range.contains(tx.end()) {
            tx.status = ResponseStatus::AddressError;
            return;
        }
        let offset = (tx.address - self.range.start) as usize;
        // SAFETY: bounds checked above
        unsafe {
            match tx.command {
                Command::Read => std::ptr::copy_nonoverlapping(self.host.add(offset), tx.data.as_mut_ptr(), tx.len()),
                Command::Write => std::ptr::copy_nonoverlapping(tx.data.as_ptr(), self.host.add(offset), tx.len()),
                Command::Ignore => {}
            }
        }
        tx.status = ResponseStatus::Ok;
        tx.dmi_allowed = true;
        *delay += 10;
    }

    fn direct_mem(&self, address: u64, _access: AccessFlags) -> DirectMemReply {
        if !self.range.contains(address) {
            return DirectMemReply::Denied;
        }
        let mut desc = DmiDescriptor::new(self.range.start, self.range.end, AccessFlags::READ_WRITE, self.host);
        desc.read_latency = 10;
        desc.write_latency = 10;
        DirectMemReply::Granted(desc)
    }

    fn attach_backward(&self, sink: Weak<dyn InvalidationSink>) {
        *self.sink.lock() = Some(sink);
    }
}

/// Core incrementing a 32-bit counter in memory, forever
pub struct CountingCore {
    addr: u64,
    ticks_per_iteration: u64,
    clock: u64,
    halted: bool,
    iterations: Arc<AtomicU64>,
}

impl CountingCore {
    pub fn new(addr: u64, ticks_per_iteration: u64) -> Self {
        Self {
            addr,
            ticks_per_iteration,
            clock: 0,
            halted: false,
            iterations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn iterations(&self) -> Arc<AtomicU64> {
        self.iterations.clone()
    }

    fn fault(&self, what: &str, result: AccessResult) -> LoopExit {
        LoopExit::new(ExitReason::Fault(format!(
            "counter {} at 0x{:x} failed: {:?}",
            what, self.addr, result
        )))
    }
}

impl CpuCore for CountingCore {
    fn run(
        &mut self,
        ctx: &mut EngineContext<'_>,
        port: &InitiatorBridge,
        budget: &RunBudget<'_>,
    ) -> qc_core::Result<LoopExit> {
        loop {
            if budget.exit_requested() {
                return Ok(LoopExit::new(ExitReason::Kicked));
            }
            if self.clock >= budget.deadline {
                return Ok(LoopExit::new(ExitReason::QuantumExpired));
            }

            let mut word = [0u8; 4];
            let result = port.read(ctx, self.addr, &mut word, AccessAttrs::default())?;
            if result != AccessResult::Ok {
                return Ok(self.fault("read", result));
            }
            let value = u32::from_le_bytes(word).wrapping_add(1);
            let result = port.write(ctx, self.addr, &value.to_le_bytes(), AccessAttrs::default())?;
            if result != AccessResult::Ok {
                return Ok(self.fault("write", result));
            }

            self.clock += self.ticks_per_iteration;
            self.iterations.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn has_work(&self, _irq: bool) -> bool {
        !self.halted
    }

    fn clock(&self) -> u64 {
        self.clock
    }

    fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    fn reset(&mut self) {
        debug!("Counting core at 0x{:x} reset", self.addr);
        self.clock = 0;
    }
}
