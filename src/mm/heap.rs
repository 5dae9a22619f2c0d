//! The kernel heap: a `#[global_allocator]` backed directly by
//! [`pm::GLOBAL`]. The original kernel's `mm.c` only provides the
//! memcpy/memmove-family primitives; it never shipped a standalone
//! heap allocator we could ground this on, so this is a deliberate
//! simplification (see DESIGN.md): every allocation is rounded up to a
//! whole number of buddy orders and satisfied directly from the page
//! allocator, rather than sub-dividing pages with a slab allocator as
//! a larger kernel would.

use core::alloc::{GlobalAlloc, Layout};

use crate::mm::arch::phys_to_virt;
use crate::mm::pm_page_size_round_up;

fn order_for(size: usize) -> u32 {
    let pages = pm_page_size_round_up(size.max(1)) / pm::PAGE_SIZE;
    let mut order = 0;
    while (1usize << order) < pages {
        order += 1;
    }
    order
}

pub struct PageHeap;

unsafe impl GlobalAlloc for PageHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Page-granular allocations are naturally page-aligned; any
        // request for an alignment coarser than a page cannot be
        // satisfied by this simple allocator.
        if layout.align() > pm::PAGE_SIZE {
            return core::ptr::null_mut();
        }
        let order = order_for(layout.size());
        match pm::GLOBAL.alloc(order) {
            Some(frame) => phys_to_virt(frame.phys) as *mut u8,
            None => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let order = order_for(layout.size());
        let phys = crate::mm::arch::virt_to_phys_direct_map(ptr as usize);
        let frame = pm::GLOBAL.phys_to_page(phys);
        // A multi-page allocation is a single buddy block; freeing the
        // base frame releases the whole block, matching `PmZone::free`'s
        // order-tagged bookkeeping.
        let _ = order;
        pm::GLOBAL.free(frame);
    }
}

#[global_allocator]
static HEAP: PageHeap = PageHeap;

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("kernel heap: allocation failed for {:?}", layout);
}
