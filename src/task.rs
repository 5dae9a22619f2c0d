//! Process / thread entities, the MLFQ scheduler, and SMP bring-up.
//! Grounded in the original kernel's `proc/proc.c`, `proc/thread.c`,
//! `proc/sched.c`, `proc/smp.c`.
//!
//! Register-level context switching and the per-CPU "which CPU am I"
//! query are architecture glue out of this core's scope (SPEC_FULL.md
//! §1); every scheduler entry point below takes the calling CPU's
//! [`Cpu`] handle explicitly instead of reading it out of a per-CPU
//! register, and returns the thread that should be switched to rather
//! than performing the switch itself.

pub mod process;
pub mod scheduler;
pub mod smp;
pub mod thread;

pub use process::Process;
pub use scheduler::Cpu;
pub use thread::{Thread, ThreadState};
