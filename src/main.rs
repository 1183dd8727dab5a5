//! qcosim - emulation engine / simulation kernel bridge
//!
//! Runs a small demo platform for a fixed simulated duration.

mod demo;

use anyhow::{bail, Context, Result};
use demo::{CountingCore, DemoRam};
use qc_core::config::{Config, SyncPolicy, ThreadModel};
use qc_core::kernel::{EventKernel, Kernel};
use qc_core::logging;
use qc_cpu::{CpuDriver, Instance};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

const RAM_BASE: u64 = 0x8000_0000;
const RAM_SIZE: u64 = 0x10_0000;
const CPU_COUNT: u64 = 2;
const RUN_FOR_NS: u64 = 1_000_000;

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from(&PathBuf::from(&path))
            .with_context(|| format!("loading configuration from {}", path))?,
        None => Config::load().context("loading configuration")?,
    };
    config.validate()?;
    logging::init(config.debug.log_level);

    info!(
        "Starting qcosim: {:?}, quantum {} ns, {} CPUs",
        config.sync.policy, config.sync.quantum_ns, CPU_COUNT
    );

    let kernel = EventKernel::new();
    let instance = Instance::from_config(&config, kernel.clone());
    let ram = Arc::new(DemoRam::new(RAM_BASE, RAM_SIZE)?);

    let mut drivers = Vec::new();
    let mut counters = Vec::new();
    for index in 0..CPU_COUNT {
        let core = CountingCore::new(RAM_BASE + index * 0x1000, 4);
        counters.push(core.iterations());
        drivers.push(instance.add_cpu(&format!("cpu{}", index), Box::new(core), ram.clone())?);
    }
    let controls: Vec<_> = drivers.iter().map(|driver| driver.control().clone()).collect();

    {
        let ram = ram.clone();
        kernel.schedule_at(RUN_FOR_NS / 2, move |_| {
            info!("Revoking direct access to demo RAM");
            ram.revoke();
        });
    }
    {
        let instance = instance.clone();
        kernel.schedule_at(RUN_FOR_NS, move |kernel| {
            info!("Simulated {} ns, stopping", kernel.now());
            instance.shutdown();
        });
    }

    let result = match (config.sync.policy, config.sync.thread_model) {
        (SyncPolicy::Cooperative, _) => instance.run_cooperative(drivers).map_err(anyhow::Error::from),
        (_, ThreadModel::Single) => run_single_thread(&kernel, &instance, drivers),
        (_, ThreadModel::PerCpu) => run_threaded(&kernel, &instance, drivers),
    };
    kernel.shutdown();

    println!("Simulated time: {} ns", kernel.now());
    for (control, counter) in controls.iter().zip(&counters) {
        let stats = control.port().stats();
        println!(
            "{}: {} iterations, {} ns synced, {} transactions, {} direct hits, {} invalidations",
            control.name(),
            counter.load(Ordering::Relaxed),
            control.keeper().synced_total(),
            stats.transactions,
            stats.fast_path,
            stats.invalidations,
        );
    }

    if let Err(e) = result {
        error!("Simulation failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

/// All CPUs on one engine thread; the calling thread serves the kernel
fn run_single_thread(kernel: &Arc<EventKernel>, instance: &Arc<Instance>, drivers: Vec<CpuDriver>) -> Result<()> {
    let engine = {
        let kernel = kernel.clone();
        let instance = instance.clone();
        thread::Builder::new().name("engine".into()).spawn(move || {
            let result = instance.run_single_thread(drivers);
            kernel.shutdown();
            result
        })?
    };

    kernel.serve();
    match engine.join() {
        Ok(result) => result.map_err(anyhow::Error::from),
        Err(_) => bail!("Engine thread panicked"),
    }
}

/// One OS thread per CPU; the calling thread serves the kernel
fn run_threaded(kernel: &Arc<EventKernel>, instance: &Arc<Instance>, drivers: Vec<CpuDriver>) -> Result<()> {
    let mut cpus = Vec::new();
    for driver in drivers {
        let instance = instance.clone();
        let cpu = thread::Builder::new()
            .name(driver.name().to_string())
            .spawn(move || {
                let result = driver.run();
                if result.is_err() {
                    instance.shutdown();
                }
                result
            })?;
        cpus.push(cpu);
    }

    let reaper = {
        let kernel = kernel.clone();
        thread::spawn(move || {
            let mut outcome = Ok(());
            for cpu in cpus {
                match cpu.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if outcome.is_ok() {
                            outcome = Err(anyhow::Error::from(e));
                        }
                    }
                    Err(_) => outcome = Err(anyhow::anyhow!("CPU thread panicked")),
                }
            }
            kernel.shutdown();
            outcome
        })
    };

    kernel.serve();
    match reaper.join() {
        Ok(outcome) => outcome,
        Err(_) => bail!("CPU reaper thread panicked"),
    }
}
