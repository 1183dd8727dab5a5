//! Instance coordinator
//!
//! Owns one engine instance: its exclusion lock, its direct region manager,
//! and the registry of attached CPUs. CPUs are addressed by opaque
//! generational handles, so callbacks holding a stale handle find nothing
//! instead of a recycled CPU.

use crate::driver::{CpuControl, CpuDriver, StepOutcome};
use crate::engine::CpuCore;
use crate::idle::{CooperativeIdle, IdleStrategy, ThreadedIdle};
use crate::initiator::{InitiatorBridge, PortWiring};
use parking_lot::{Mutex, RwLock};
use qc_core::config::{Config, IdleScope, SyncPolicy, ThreadModel};
use qc_core::context::{EngineContext, EngineLock, NativeQueue};
use qc_core::error::{BridgeError, Result};
use qc_core::kernel::{Kernel, SimTime};
use qc_core::protocol::{InitiatorId, Target};
use qc_core::quantum::{QuantumKeeper, TickRatio};
use qc_core::registry::{Handle, Registry};
use qc_memory::{DmiManager, PageGeometry};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Construction-time parameters of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceParams {
    /// Quantum in kernel nanoseconds
    pub quantum: SimTime,
    pub ratio: TickRatio,
    pub policy: SyncPolicy,
    pub idle_scope: IdleScope,
    pub thread_model: ThreadModel,
    /// Live alias ceiling per initiator
    pub max_aliases: usize,
    pub page: PageGeometry,
    pub verify_translations: bool,
}

impl InstanceParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            quantum: config.sync.quantum_ns,
            ratio: TickRatio::new(config.sync.tick_shift),
            policy: config.sync.policy,
            idle_scope: config.sync.idle_scope,
            thread_model: config.sync.thread_model,
            max_aliases: config.memory.max_aliases_per_initiator,
            page: PageGeometry::new(config.memory.min_page_bits),
            verify_translations: config.debug.verify_translations,
        }
    }
}

impl Default for InstanceParams {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One emulation engine instance and its CPUs
pub struct Instance {
    params: InstanceParams,
    kernel: Arc<dyn Kernel>,
    engine: Arc<EngineLock>,
    dmi: Arc<DmiManager>,
    cpus: RwLock<Registry<Arc<CpuControl>>>,
    shared_idle: Option<Arc<dyn IdleStrategy>>,
    shared_keeper: Mutex<Option<Arc<QuantumKeeper>>>,
    ids: Arc<AtomicU32>,
}

impl Instance {
    pub fn new(params: InstanceParams, kernel: Arc<dyn Kernel>) -> Arc<Self> {
        let shared_idle: Option<Arc<dyn IdleStrategy>> =
            match (params.policy, params.thread_model, params.idle_scope) {
                (SyncPolicy::Cooperative, _, _) => Some(Arc::new(CooperativeIdle::new(kernel.clone()))),
                (_, ThreadModel::Single, _) => Some(Arc::new(ThreadedIdle::round_robin())),
                (_, ThreadModel::PerCpu, IdleScope::Instance) => Some(Arc::new(ThreadedIdle::new())),
                (_, ThreadModel::PerCpu, IdleScope::PerCpu) => None,
            };
        info!(
            "Engine instance created: {:?} ({:?}), quantum {} ns, alias ceiling {}",
            params.policy, params.thread_model, params.quantum, params.max_aliases
        );

        Arc::new(Self {
            params,
            kernel,
            engine: Arc::new(EngineLock::new()),
            dmi: Arc::new(DmiManager::new(params.max_aliases)),
            cpus: RwLock::new(Registry::new()),
            shared_idle,
            shared_keeper: Mutex::new(None),
            ids: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn from_config(config: &Config, kernel: Arc<dyn Kernel>) -> Arc<Self> {
        Self::new(InstanceParams::from_config(config), kernel)
    }

    pub fn params(&self) -> &InstanceParams {
        &self.params
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn dmi(&self) -> &Arc<DmiManager> {
        &self.dmi
    }

    pub fn engine_lock(&self) -> &Arc<EngineLock> {
        &self.engine
    }

    /// Enter the engine's native context
    pub fn enter(&self) -> EngineContext<'_> {
        self.engine.enter()
    }

    fn idle_for_cpu(&self) -> Arc<dyn IdleStrategy> {
        match &self.shared_idle {
            Some(idle) => idle.clone(),
            None => Arc::new(ThreadedIdle::new()),
        }
    }

    /// CPUs sharing one thread share one keeper
    fn keeper_for_cpu(&self) -> Arc<QuantumKeeper> {
        let make = || {
            Arc::new(QuantumKeeper::new(
                self.params.quantum,
                self.params.ratio,
                self.params.policy,
                self.kernel.clone(),
            ))
        };
        if self.params.policy.is_threaded() && self.params.thread_model == ThreadModel::PerCpu {
            make()
        } else {
            self.shared_keeper.lock().get_or_insert_with(make).clone()
        }
    }

    /// Attach a CPU whose memory port is bound to `target`
    pub fn add_cpu(
        self: &Arc<Self>,
        name: &str,
        core: Box<dyn CpuCore>,
        target: Arc<dyn Target>,
    ) -> Result<CpuDriver> {
        let id = InitiatorId(self.ids.fetch_add(1, Ordering::Relaxed));
        let native = NativeQueue::new();
        let exit_request = Arc::new(AtomicBool::new(false));
        let keeper = self.keeper_for_cpu();

        let port = InitiatorBridge::new(
            id,
            format!("{}.mem", name),
            PortWiring {
                kernel: self.kernel.clone(),
                keeper: keeper.clone(),
                dmi: self.dmi.clone(),
                native: native.clone(),
                exit_request: exit_request.clone(),
                ids: self.ids.clone(),
                page: self.params.page,
                verify_translations: self.params.verify_translations,
            },
        );
        if let Err(e) = port.bind(target) {
            error!("CPU '{}': {}", name, e);
            let ctx = self.engine.enter();
            self.dmi.unregister_initiator(&ctx, id);
            return Err(e);
        }

        let control = Arc::new(CpuControl::new(
            name,
            self.idle_for_cpu(),
            keeper,
            native.clone(),
            exit_request,
            port,
        ));
        let weak = Arc::downgrade(&control);
        native.set_waker(move || {
            if let Some(control) = weak.upgrade() {
                control.kick();
            }
        });

        let handle = self.cpus.write().insert(control.clone());
        info!("CPU '{}' attached as {} (initiator {})", name, handle, id);
        Ok(CpuDriver::new(handle, control, core, self.engine.clone(), self.clone()))
    }

    pub fn cpu(&self, handle: Handle) -> Option<Arc<CpuControl>> {
        self.cpus.read().get(handle).cloned()
    }

    pub fn cpus(&self) -> Vec<(Handle, Arc<CpuControl>)> {
        self.cpus
            .read()
            .iter()
            .map(|(handle, control)| (handle, control.clone()))
            .collect()
    }

    /// Drop a CPU from the registry
    pub fn remove_cpu(&self, handle: Handle) -> Result<Arc<CpuControl>> {
        let control = self
            .cpus
            .write()
            .remove(handle)
            .ok_or_else(|| BridgeError::StaleHandle(handle.to_string()))?;
        debug!("CPU '{}' detached ({})", control.name(), handle);
        Ok(control)
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.read().len()
    }

    /// Whether any attached CPU had work at its last step
    pub fn can_run(&self) -> bool {
        self.cpus.read().iter().any(|(_, control)| control.is_runnable())
    }

    /// Finish every attached CPU
    pub fn shutdown(&self) {
        let cpus = self.cpus();
        for (_, control) in &cpus {
            control.finish();
        }
        info!("Engine instance shut down ({} CPUs)", cpus.len());
    }

    /// Step `drivers` round-robin on the calling thread until all finish.
    ///
    /// The calling thread must be the kernel thread: syncs and idle waits run
    /// the kernel inline. The first fatal error shuts the instance down and is
    /// returned once every driver has been torn down.
    pub fn run_cooperative(&self, drivers: Vec<CpuDriver>) -> Result<()> {
        if !self.kernel.is_kernel_thread() {
            warn!("Cooperative run started off the kernel thread");
        }
        self.round_robin(drivers)
    }

    /// Step `drivers` round-robin on the calling engine thread until all finish.
    ///
    /// For a threaded policy with [`ThreadModel::Single`]. The kernel must be
    /// served on another thread: syncs block until it catches up and an idle
    /// round suspends the calling thread.
    pub fn run_single_thread(&self, drivers: Vec<CpuDriver>) -> Result<()> {
        if self.kernel.is_kernel_thread() {
            warn!("Single engine thread started on the kernel thread");
        }
        if !self.params.policy.is_threaded() || self.params.thread_model != ThreadModel::Single {
            warn!(
                "Single engine thread started for a {:?} ({:?}) instance",
                self.params.policy, self.params.thread_model
            );
        }
        self.round_robin(drivers)
    }

    fn round_robin(&self, mut drivers: Vec<CpuDriver>) -> Result<()> {
        let mut result = Ok(());

        while !drivers.is_empty() {
            let mut index = 0;
            while index < drivers.len() {
                match drivers[index].step() {
                    Ok(StepOutcome::Finished) => {
                        drivers.swap_remove(index).teardown();
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("CPU '{}' stopped: {}", drivers[index].name(), e);
                        if result.is_ok() {
                            result = Err(e);
                        }
                        self.shutdown();
                    }
                }
                index += 1;
            }
        }
        result
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("params", &self.params)
            .field("cpus", &self.cpu_count())
            .field("regions", &self.dmi.region_count())
            .finish()
    }
}
