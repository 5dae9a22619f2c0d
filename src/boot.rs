//! Bootloader handoff types (SPEC_FULL.md §6 "Bootloader handoff").
//! The actual handoff protocol (Limine, a custom stub, ...) is the
//! out-of-scope collaborator named in §1; this module only names the
//! shape every supported protocol must be translated into before
//! calling [`crate::mm::bootstrap::init`].

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Usable,
    Reserved,
    Bad,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: usize,
    pub length: usize,
    pub kind: MemoryKind,
}

/// One secondary CPU's entry point address, as reported by the
/// bootloader's MP/SMP info array. The identifier distinguishes the
/// bootstrap processor, which is already running and needs no entry
/// address.
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    pub id: usize,
    pub is_bsp: bool,
}

/// A boot module the loader found alongside the kernel image (the
/// initrd, or a kernel module binary under `/boot/modules/`).
pub struct BootModule {
    pub path: String,
    pub address: usize,
    pub size: usize,
}

/// Everything the core requires from whatever booted it, gathered into
/// one value before any subsystem initializes.
pub struct BootInfo {
    pub memory_map: Vec<MemoryRegion>,
    pub hhdm_offset: usize,
    pub kernel_phys_base: usize,
    pub kernel_virt_base: usize,
    pub cpus: Vec<CpuInfo>,
    pub modules: Vec<BootModule>,
}

impl BootInfo {
    pub fn find_module(&self, path: &str) -> Option<&BootModule> {
        self.modules.iter().find(|m| m.path == path)
    }
}
