//! Kernel bring-up: carves the PM frame table out of the memory map,
//! releases usable regions to the allocator, and builds the kernel
//! address space (direct map + kernel image + remaining usable RAM
//! above 4 GiB). Grounded in the original kernel's `mm/pm.c`
//! (`pm_init`) and `mm/vm.c` (`vm_init`/`do_big_mappings`).

use crate::boot::{BootInfo, MemoryKind};
use crate::mm::arch::{self, Prot, HUGE_PAGE_1GIB, HUGE_PAGE_2MIB, PAGE_4KIB};
use crate::mm::vm::AddressSpace;
use crate::mm::{pm_page_size_align, pm_page_size_round_up};
use crate::prelude::*;

use spinlock::Spin;

const FOUR_GIB: usize = 4 << 30;
/// Largest-to-smallest order of page sizes `do_big_mappings` tries at
/// each step, matching the original's `ARCH_PAGE_SIZES` search order.
const BIG_PAGE_SIZES: [usize; 3] = [HUGE_PAGE_1GIB, HUGE_PAGE_2MIB, PAGE_4KIB];

static KERNEL_AS: Spin<Option<Arc<AddressSpace>>> = Spin::new(None);

/// The process-wide kernel address space, created once by [`init`].
pub fn kernel_address_space() -> Arc<AddressSpace> {
    KERNEL_AS
        .lock()
        .clone()
        .expect("mm::bootstrap: kernel address space used before init")
}

/// Finds the storage for the PM frame table: the largest usable region
/// in `info.memory_map`, big enough to hold one [`pm::PageFrame`] per
/// page of all of physical memory. Returns the region's base and the
/// number of bytes the table consumes from its front.
fn pick_frame_table_region(info: &BootInfo, frame_count: usize) -> (usize, usize) {
    let table_bytes = pm_page_size_round_up(frame_count * core::mem::size_of::<pm::PageFrame>());

    info.memory_map
        .iter()
        .filter(|r| matches!(r.kind, MemoryKind::Usable) && r.length >= table_bytes)
        .max_by_key(|r| r.length)
        .map(|r| (r.base, table_bytes))
        .expect("mm::bootstrap: no usable region large enough for the frame table")
}

/// Maps `[vaddr, vaddr + length)` to `[paddr, paddr + length)` in the
/// kernel address space, trying the largest aligned page size at each
/// step (`do_big_mappings`).
fn map_big_region(as_: &AddressSpace, vaddr: usize, paddr: usize, length: usize) -> KResult<()> {
    let mut i = 0;
    while i < length {
        let remaining = length - i;
        let page_size = BIG_PAGE_SIZES
            .iter()
            .copied()
            .find(|&size| (vaddr + i) % size == 0 && (paddr + i) % size == 0 && remaining >= size)
            .unwrap_or(PAGE_4KIB);

        as_.map_raw(vaddr + i, paddr + i, page_size, Prot::WRITE | Prot::EXEC)?;
        i += page_size;
    }
    Ok(())
}

/// Brings up physical and virtual memory management from the
/// bootloader's handoff. Must run exactly once, before any allocation.
pub fn init(info: &BootInfo) {
    // SAFETY: runs once, before any arch-paging call or concurrent access.
    unsafe {
        arch::set_hhdm_offset(info.hhdm_offset);
    }

    let highest = info
        .memory_map
        .iter()
        .map(|r| r.base + r.length)
        .max()
        .unwrap_or(0);
    let frame_count = pm_page_size_round_up(highest) / PAGE_4KIB;

    let (table_base, table_bytes) = pick_frame_table_region(info, frame_count);
    let table_virt = arch::phys_to_virt(table_base);

    // SAFETY: `table_base` names a usable, otherwise-untouched region at
    // least `table_bytes` long; `PageFrame::new` is a valid all-zero-ish
    // bit pattern for every frame's initial state.
    let frames: &'static [pm::PageFrame] = unsafe {
        let ptr = table_virt as *mut pm::PageFrame;
        for i in 0..frame_count {
            ptr.add(i).write(pm::PageFrame::new(i * PAGE_4KIB));
        }
        core::slice::from_raw_parts(ptr, frame_count)
    };
    pm::GLOBAL.init(frames, 0);

    for region in &info.memory_map {
        if !matches!(region.kind, MemoryKind::Usable) {
            continue;
        }
        let mut base = pm_page_size_round_up(region.base);
        let mut end = pm_page_size_align(region.base + region.length);
        if region.base == table_base {
            base = pm_page_size_round_up(table_base + table_bytes);
        }
        if end <= base {
            continue;
        }
        if base < table_base + table_bytes && end > table_base {
            base = pm_page_size_round_up(table_base + table_bytes);
        }
        if end > base {
            pm::GLOBAL.release_region(base, end - base);
        }
    }

    arch::init();

    let as_ = AddressSpace::create(info.hhdm_offset, usize::MAX)
        .expect("mm::bootstrap: failed to create the kernel address space");

    // Direct-map the first 4 GiB of physical memory at the HHDM base,
    // per the bootloader's contract (`do_big_mappings(HHDM, 0, 4GiB)`).
    map_big_region(&as_, info.hhdm_offset, 0, FOUR_GIB).expect("mm::bootstrap: direct map failed");

    // Map the kernel image at its linked virtual base.
    map_big_region(&as_, info.kernel_virt_base, info.kernel_phys_base, 2 << 30)
        .expect("mm::bootstrap: kernel image map failed");

    // Map whatever usable memory lies above the 4 GiB direct-map range.
    for region in &info.memory_map {
        if !matches!(region.kind, MemoryKind::Usable) {
            continue;
        }
        let mut start = pm_page_size_align(region.base);
        let end = pm_page_size_round_up(region.base + region.length);
        if end <= FOUR_GIB {
            continue;
        }
        if start < FOUR_GIB {
            start = FOUR_GIB;
        }
        let length = end - start;
        if length == 0 {
            continue;
        }
        map_big_region(&as_, start + info.hhdm_offset, start, length)
            .expect("mm::bootstrap: high-memory map failed");
    }

    as_.load();
    *KERNEL_AS.lock() = Some(Arc::new(as_));

    println_info!("Virtual memory initialized.");
}
