//! DMA-coherent memory: physical pages a device can be handed the
//! address of directly, reached on the kernel side through the HHDM.
//! Grounded in the original kernel's `mm/dma.c`.

use crate::mm::arch::phys_to_virt;
use crate::mm::PAGE_4KIB;
use crate::prelude::*;

fn order_for_pages(pages: usize) -> u32 {
    let mut order = 0u32;
    while (1usize << order) < pages {
        order += 1;
    }
    order
}

/// Allocates `size` bytes (rounded up to whole pages) of physically
/// contiguous, DMA-coherent memory. Returns its HHDM virtual address.
pub fn dma_map(size: usize) -> KResult<usize> {
    let pages = (size + PAGE_4KIB - 1) / PAGE_4KIB;
    let order = order_for_pages(pages.max(1));

    let frame = pm::GLOBAL.alloc(order).ok_or(Errno::ENOMEM)?;
    let count = 1usize << order;
    // SAFETY: `frame` is the first of `count` contiguous frames this
    // order's allocation reserved; each is addressable via `phys_to_page`.
    for i in 0..count {
        let f = pm::GLOBAL.phys_to_page(frame.phys + i * PAGE_4KIB);
        f.refcount_inc();
    }

    Ok(phys_to_virt(frame.phys))
}

/// Releases memory obtained from [`dma_map`].
pub fn dma_unmap(virt: usize, size: usize) {
    let phys = virt - crate::mm::arch::hhdm_offset();
    let pages = (size + PAGE_4KIB - 1) / PAGE_4KIB;
    let order = order_for_pages(pages.max(1));
    let count = 1usize << order;

    let base = pm::GLOBAL.phys_to_page(phys);
    for i in 0..count {
        let f = pm::GLOBAL.phys_to_page(phys + i * PAGE_4KIB);
        if f.refcount_dec() {
            // first frame of the run is the one `alloc` returned; the
            // allocator expects that exact reference when freeing.
            if i == 0 {
                pm::GLOBAL.free(base);
            }
        }
    }
}

pub fn dma_phys_addr(virt: usize) -> usize {
    virt - crate::mm::arch::hhdm_offset()
}
