//! AArch64 two-root paging (`TTBR0_EL1`/`TTBR1_EL1`), grounded in the
//! original kernel's `arch/aarch64/paging.c`.

use super::{is_higher_half, phys_to_virt, ArchPaging, Prot, HUGE_PAGE_1GIB, HUGE_PAGE_2MIB};
use crate::prelude::*;

use spinlock::Spin;

const PTE_VALID: u64 = 1 << 0;
const PTE_TABLE: u64 = 1 << 1;
const PTE_PAGE_4K: u64 = 1 << 1;
const PTE_READONLY: u64 = 1 << 6;
const PTE_USER: u64 = 1 << 7;
const PTE_ACCESS: u64 = 1 << 10;
const PTE_XN: u64 = 1 << 54;
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const ENTRIES_PER_TABLE: usize = 512;

fn translate_prot(prot: Prot) -> u64 {
    let mut bits = 0;
    if !prot.contains(Prot::WRITE) {
        bits |= PTE_READONLY;
    }
    if prot.contains(Prot::USER) {
        bits |= PTE_USER;
    }
    if !prot.contains(Prot::EXEC) {
        bits |= PTE_XN;
    }
    bits
}

fn table_at(phys: u64) -> &'static mut [u64; ENTRIES_PER_TABLE] {
    let virt = phys_to_virt((phys & PTE_ADDR_MASK) as usize);
    // SAFETY: see the x86_64 `table_at` counterpart; same invariant.
    unsafe { &mut *(virt as *mut [u64; ENTRIES_PER_TABLE]) }
}

fn alloc_table() -> KResult<u64> {
    let frame = pm::GLOBAL.alloc(0).ok_or(Errno::ENOMEM)?;
    table_at(frame.phys as u64).fill(0);
    Ok(frame.phys as u64)
}

fn indices(vaddr: usize) -> [usize; 4] {
    // Index 0 is level 0 (most significant), 3 is level 3 (leaf).
    [
        (vaddr >> 39) & 0x1FF,
        (vaddr >> 30) & 0x1FF,
        (vaddr >> 21) & 0x1FF,
        (vaddr >> 12) & 0x1FF,
    ]
}

fn target_level(size: usize) -> usize {
    if size == HUGE_PAGE_1GIB {
        1
    } else if size == HUGE_PAGE_2MIB {
        2
    } else {
        3
    }
}

/// The single higher-half root table shared by every address space via
/// `TTBR1_EL1`, built once in [`ArchMap::arch_init`].
static HIGHER_HALF_ROOT: Spin<u64> = Spin::new(0);
static TTBR1_LOADED: Spin<bool> = Spin::new(false);

pub struct ArchMap {
    root_low: u64,
    root_high: u64,
}

impl ArchMap {
    fn root_for(&self, vaddr: usize) -> u64 {
        if is_higher_half(vaddr) {
            self.root_high
        } else {
            self.root_low
        }
    }
}

impl ArchPaging for ArchMap {
    fn map_create() -> KResult<Self> {
        let root_low = alloc_table()?;
        let root_high = *HIGHER_HALF_ROOT.lock();
        Ok(Self { root_low, root_high })
    }

    fn map_page(&mut self, vaddr: usize, paddr: usize, size: usize, prot: Prot) -> KResult<()> {
        let pte_prot = translate_prot(prot);
        let idx = indices(vaddr);
        let target = target_level(size);

        let mut table_phys = self.root_for(vaddr);
        for level in 0..target {
            let table = table_at(table_phys);
            let entry_idx = idx[level];
            if table[entry_idx] & PTE_VALID == 0 {
                let child_phys = alloc_table()?;
                table[entry_idx] = child_phys | PTE_VALID | PTE_TABLE | PTE_ACCESS;
            }
            pm::GLOBAL.phys_to_page(table_phys as usize).refcount_inc();
            table_phys = table[entry_idx] & PTE_ADDR_MASK;
        }

        let leaf_idx = idx[target];
        let table = table_at(table_phys);
        pm::GLOBAL.phys_to_page(table_phys as usize).refcount_inc();
        let type_bit = if target == 3 { PTE_PAGE_4K } else { 0 };
        table[leaf_idx] = paddr as u64 | PTE_VALID | type_bit | PTE_ACCESS | pte_prot;

        Ok(())
    }

    fn unmap_page(&mut self, vaddr: usize) -> KResult<()> {
        let idx = indices(vaddr);
        let mut tables = [self.root_for(vaddr), 0, 0, 0];

        let mut level = 0usize;
        loop {
            let table = table_at(tables[level]);
            let entry = table[idx[level]];
            if entry & PTE_VALID == 0 {
                return Err(Errno::EINVAL);
            }
            if entry & PTE_TABLE == 0 || level == 2 {
                break;
            }
            tables[level + 1] = entry & PTE_ADDR_MASK;
            level += 1;
        }

        table_at(tables[level])[idx[level]] = 0;

        loop {
            let table_phys = tables[level];
            let frame = pm::GLOBAL.phys_to_page(table_phys as usize);
            if !frame.refcount_dec() {
                break;
            }
            if level > 0 {
                let parent_idx = idx[level - 1];
                table_at(tables[level - 1])[parent_idx] = 0;
                pm::GLOBAL.free(frame);
            }
            if level == 0 {
                break;
            }
            level -= 1;
        }

        let vpage = vaddr >> 12;
        // SAFETY: `vae1is` + the following barriers invalidate exactly
        // the one TLB entry just cleared, for this EL1 translation regime.
        unsafe {
            core::arch::asm!(
                "tlbi vae1is, {0}",
                "dsb ish",
                "isb",
                in(reg) vpage,
                options(nostack),
            );
        }

        Ok(())
    }

    fn vaddr_to_paddr(&self, vaddr: usize) -> Option<usize> {
        let idx = indices(vaddr);

        let l0 = table_at(self.root_for(vaddr));
        let l0e = l0[idx[0]];
        if l0e & PTE_VALID == 0 {
            return None;
        }

        let l1 = table_at(l0e & PTE_ADDR_MASK);
        let l1e = l1[idx[1]];
        if l1e & PTE_VALID == 0 {
            return None;
        }
        if l1e & PTE_TABLE == 0 {
            return Some((l1e & PTE_ADDR_MASK) as usize + (vaddr & (HUGE_PAGE_1GIB - 1)));
        }

        let l2 = table_at(l1e & PTE_ADDR_MASK);
        let l2e = l2[idx[2]];
        if l2e & PTE_VALID == 0 {
            return None;
        }
        if l2e & PTE_TABLE == 0 {
            return Some((l2e & PTE_ADDR_MASK) as usize + (vaddr & (HUGE_PAGE_2MIB - 1)));
        }

        let l3 = table_at(l2e & PTE_ADDR_MASK);
        let l3e = l3[idx[3]];
        if l3e & PTE_VALID == 0 {
            return None;
        }
        Some((l3e & PTE_ADDR_MASK) as usize + (vaddr & 0xFFF))
    }

    fn load(&self) {
        // SAFETY: both roots name live, fully-populated tables; TTBR1
        // is only (re)written the first time, matching the original's
        // `ttbr1_loaded` latch.
        unsafe {
            core::arch::asm!(
                "msr ttbr0_el1, {0}",
                "isb",
                in(reg) self.root_low,
                options(nostack),
            );
        }

        let mut loaded = TTBR1_LOADED.lock();
        if !*loaded {
            unsafe {
                core::arch::asm!(
                    "msr ttbr1_el1, {0}",
                    "isb",
                    in(reg) self.root_high,
                    options(nostack),
                );
            }
            *loaded = true;
        }
    }

    fn arch_init() {
        let phys = alloc_table().expect("arch_init: out of memory for higher-half root");
        *HIGHER_HALF_ROOT.lock() = phys;
    }
}

impl Drop for ArchMap {
    fn drop(&mut self) {
        // The low (user) root is private to this map; the shared
        // higher-half root outlives every `ArchMap` and is never freed
        // here, matching the original's `// TODO: destroy page tables`.
        pm::GLOBAL.free(pm::GLOBAL.phys_to_page(self.root_low as usize));
    }
}
