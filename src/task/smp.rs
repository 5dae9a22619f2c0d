//! SMP bring-up (SPEC_FULL.md §4.12). Grounded in the original kernel's
//! `proc/smp.c`. Gated by the `smp` Cargo feature: with it enabled,
//! every CPU the bootloader reports gets a [`Cpu`] descriptor and an
//! idle thread; with it disabled, exactly one descriptor is registered
//! for the bootstrap processor and the reported CPU list is ignored.
//!
//! Actually jumping a secondary's program counter to [`secondary_entry`]
//! is architecture-specific firmware handoff glue out of this core's
//! scope (SPEC_FULL.md §1); this module only prepares the thread each
//! secondary should find itself running as once that glue starts it.

use crate::boot::CpuInfo;
use crate::prelude::*;
use crate::task::process::{self, Process};
use crate::task::scheduler::{self, Cpu};
use crate::task::thread::ThreadState;

pub struct SmpInit {
    pub bsp: Arc<Cpu>,
    pub secondaries: Vec<Arc<Cpu>>,
}

/// Serializes each secondary's one-time init for deterministic log
/// ordering, mirroring the original's single `slock` held across
/// `arch_lcpu_init`.
static BRINGUP_LOCK: Spin<()> = Spin::new(());

fn idle_entry() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

fn spawn_idle(proc: &Arc<Process>, info: &CpuInfo) -> Arc<Cpu> {
    let idle_thread = process::thread_create(proc, idle_entry as usize, 0);
    let cpu = scheduler::register_cpu(info.id);
    idle_thread.set_assigned_cpu(info.id);
    cpu.set_idle_thread(idle_thread);
    cpu
}

/// The scheduler itself (`scheduler::init`) must already have run; this
/// only registers CPUs and their idle threads against it, so bringing
/// up SMP never discards threads the boot sequence already enqueued.
#[cfg(feature = "smp")]
pub fn init(cpus: &[CpuInfo]) -> KResult<SmpInit> {
    let idle_proc = Process::create_kernel("System Idle Process")?;

    let mut bsp = None;
    let mut secondaries = Vec::new();

    for info in cpus {
        let cpu = spawn_idle(&idle_proc, info);
        if info.is_bsp {
            bsp = Some(cpu);
        } else {
            secondaries.push(cpu);
        }
    }

    let bsp = bsp.expect("smp: bootloader-reported CPU list has no BSP entry");
    println_info!("{} CPU(s) registered ({} secondary).", cpus.len(), secondaries.len());
    Ok(SmpInit { bsp, secondaries })
}

/// Single-CPU build: registers exactly one descriptor for the BSP and
/// never looks at the bootloader's MP info array.
#[cfg(not(feature = "smp"))]
pub fn init(_cpus: &[CpuInfo]) -> KResult<SmpInit> {
    let idle_proc = Process::create_kernel("System Idle Process")?;

    let bsp = spawn_idle(&idle_proc, &CpuInfo { id: 0, is_bsp: true });
    Ok(SmpInit {
        bsp,
        secondaries: Vec::new(),
    })
}

/// What a CPU runs once the (out-of-scope) bring-up glue has actually
/// jumped it here: one-time init serialized behind a global lock, then
/// forever `yield(ready)` until something else is scheduled onto it.
/// The bootstrap processor enters this same loop once boot finishes
/// (SPEC_FULL.md §2, "BSP becomes an idle thread").
pub fn secondary_entry(cpu: &Cpu) -> ! {
    {
        let _guard = BRINGUP_LOCK.lock();
        println_info!("CPU #{} initialized. Idling...", cpu.id);
    }

    loop {
        scheduler::yield_now(cpu, ThreadState::Ready, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises the registration logic `init` builds on without going
    // through `Process::create_kernel`, which needs the real kernel
    // address space singleton that only a booted kernel has.
    #[test]
    fn spawn_idle_registers_cpu_with_assigned_idle_thread() {
        scheduler::init();
        let proc = Process::create_for_test("idle");
        let cpu = spawn_idle(&proc, &CpuInfo { id: 7, is_bsp: true });
        assert_eq!(cpu.id, 7);
        assert_eq!(cpu.current_thread().assigned_cpu(), 7);
    }
}
