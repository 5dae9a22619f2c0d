//! The architecture paging seam (SPEC_FULL.md §4.2 "ARCH-PG"), grounded
//! in the original kernel's `arch/paging.h` contract and the per-arch
//! `arch/x86_64/paging.c` / `arch/aarch64/paging.c` implementations.
//! The PTE newtype-over-bitflags style follows the teacher's
//! `src/kernel/mem/page_table.rs`.

#[cfg(all(feature = "platform-x86_64", target_arch = "x86_64"))]
mod x86_64;
#[cfg(all(feature = "platform-x86_64", target_arch = "x86_64"))]
pub use self::x86_64::ArchMap;

#[cfg(all(feature = "platform-aarch64", target_arch = "aarch64"))]
mod aarch64;
#[cfg(all(feature = "platform-aarch64", target_arch = "aarch64"))]
pub use self::aarch64::ArchMap;

use crate::prelude::*;

pub const HUGE_PAGE_1GIB: usize = 1 << 30;
pub const HUGE_PAGE_2MIB: usize = 1 << 21;
pub const PAGE_4KIB: usize = 1 << 12;

bitflags::bitflags! {
    /// Protection bits requested of a mapping, translated to whatever
    /// the architecture's PTE format calls them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const WRITE = 1 << 0;
        const USER  = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// The higher-half direct map offset, set once by [`set_hhdm_offset`]
/// during early boot before any arch paging call runs.
static mut HHDM_OFFSET: usize = 0;

/// # Safety
/// Must be called exactly once, before any other function in this
/// module, with the offset the bootloader reports for the direct map
/// of all physical memory.
pub unsafe fn set_hhdm_offset(offset: usize) {
    HHDM_OFFSET = offset;
}

fn hhdm_offset() -> usize {
    // SAFETY: written once at boot before any reader runs (see
    // `set_hhdm_offset`); no concurrent writers ever exist afterward.
    unsafe { HHDM_OFFSET }
}

pub fn phys_to_virt(phys: usize) -> usize {
    phys + hhdm_offset()
}

pub fn virt_to_phys_direct_map(virt: usize) -> usize {
    virt - hhdm_offset()
}

fn is_higher_half(vaddr: usize) -> bool {
    vaddr >= hhdm_offset()
}

/// One architecture's page-table map. Implementors own a root table
/// allocated from [`pm::GLOBAL`] and keep a refcount on every
/// intermediate table they create, mirroring the original's
/// `pm_page_refcount_inc`/`pm_page_refcount_dec` bookkeeping used to
/// decide when an interior table can be freed.
pub trait ArchPaging: Sized {
    /// Allocates a fresh, empty top-level map with the kernel's
    /// higher-half mappings already shared in, as
    /// `arch_paging_map_create` shares the 256 pre-allocated PML3s.
    fn map_create() -> KResult<Self>;

    /// Maps a single page, 2 MiB large page, or 1 GiB huge page at
    /// `vaddr` to `paddr`, allocating any missing intermediate table.
    /// `size` must be one of [`PAGE_4KIB`], [`HUGE_PAGE_2MIB`],
    /// [`HUGE_PAGE_1GIB`].
    fn map_page(&mut self, vaddr: usize, paddr: usize, size: usize, prot: Prot) -> KResult<()>;

    /// Clears the mapping at `vaddr`, releasing now-empty intermediate
    /// tables back to the allocator and flushing the TLB entry.
    fn unmap_page(&mut self, vaddr: usize) -> KResult<()>;

    /// Walks the map without modifying it, returning the physical
    /// address `vaddr` currently resolves to, if any.
    fn vaddr_to_paddr(&self, vaddr: usize) -> Option<usize>;

    /// Installs this map as the currently active one (`CR3`/`TTBR0_EL1`).
    fn load(&self);

    /// One-time architecture setup run before any map is created
    /// (builds the shared higher-half tables).
    fn arch_init();
}

#[cfg(any(
    all(feature = "platform-x86_64", target_arch = "x86_64"),
    all(feature = "platform-aarch64", target_arch = "aarch64"),
))]
pub fn init() {
    ArchMap::arch_init();
}
