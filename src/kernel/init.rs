/// Kernel initialization phases
use crate::config::KernelConfig;
use crate::interrupts::{self, pic};
use crate::kernel::status::BootPhases;
use crate::kernel::{Kernel, KERNEL};
use crate::platform::PcPlatform;
use crate::println;
use crate::trap::frame::trapname;

const PHASES: [&str; 4] = ["Task State", "Gate Table", "Interrupt Controller", "Environments"];

/// Bring up trap handling on the boot core and install the kernel.
/// Interrupts stay disabled; the caller enables them once it is ready to
/// idle.
pub fn init_kernel(config: KernelConfig) -> Result<(), &'static str> {
    let mut phases = BootPhases::new(PHASES);
    println!("╔════════════════════════════════════════╗");
    println!("║        envkern Kernel Initialization   ║");
    println!("╚════════════════════════════════════════╝\n");

    let result = run_phases(&mut phases, config);
    if let Some((name, err)) = phases.failure() {
        println!("Boot stopped in {}: {}", name, err);
        for (name, state) in phases.iter() {
            println!("    {:<22} {}", name, state);
        }
        return result;
    }
    if phases.complete() {
        println!("\n✅ Kernel initialization complete!\n");
    }
    result
}

fn run_phases(phases: &mut BootPhases<4>, config: KernelConfig) -> Result<(), &'static str> {
    init_phase(phases, "Task State", || {
        interrupts::gdt::init_percpu(0);
        Ok(())
    })?;
    init_phase(phases, "Gate Table", init_gates)?;
    init_phase(phases, "Interrupt Controller", || {
        pic::init();
        PcPlatform::rtc_enable_periodic();
        Ok(())
    })?;
    init_phase(phases, "Environments", || {
        *KERNEL.lock() = Some(Kernel::new(config));
        Ok(())
    })
}

fn init_phase(
    phases: &mut BootPhases<4>,
    name: &'static str,
    init_fn: impl FnOnce() -> Result<(), &'static str>,
) -> Result<(), &'static str> {
    let step = phases.begin(name).unwrap_or(0);
    println!("[{}/{}] Initializing {}...", step, phases.total(), name);

    let outcome = init_fn();
    phases.finish(name, outcome);
    match outcome {
        Ok(()) => {
            println!("    ✓ {} initialized successfully\n", name);
            Ok(())
        }
        Err(e) => {
            println!("    ✗ {} failed: {}\n", name, e);
            log::error!("{} failed: {}", name, e);
            Err(e)
        }
    }
}

fn init_gates() -> Result<(), &'static str> {
    let table = interrupts::trap_init();
    if let Some(vector) = table.first_missing() {
        log::error!("no entry stub for vector {} ({})", vector, trapname(u64::from(vector)));
        return Err("trap entry stub missing");
    }
    table.load();
    Ok(())
}
