//! Virtual address spaces: sorted segment lists, map/unmap with
//! collision resolution, user copy helpers, and copy-on-write
//! cloning. Grounded in the original kernel's `mm/vm.c`.

use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::mm::arch::{self, ArchPaging, Prot, PAGE_4KIB};
use crate::mm::pm_page_size_align;
use crate::prelude::*;

use spinlock::Spin;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const PRIVATE         = 0x01;
        const SHARED          = 0x02;
        const ANON            = 0x04;
        const FIXED           = 0x08;
        const FIXED_NOREPLACE = 0x10;
        const POPULATE        = 0x20;
    }
}

/// What a vnode-backed segment delegates mapping to. Defined here
/// rather than depending on `crate::vfs` directly, so the VM layer and
/// the VFS layer can be built independently of each other; `vfs::Vnode`
/// implements this trait.
pub trait MmapBacking: Send + Sync {
    fn mmap(
        &self,
        as_: &AddressSpace,
        vaddr: usize,
        length: usize,
        prot: Prot,
        flags: MapFlags,
        offset: u64,
    ) -> KResult<()>;
}

pub struct Segment {
    pub start: usize,
    pub length: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub vnode: Option<Arc<dyn MmapBacking>>,
    pub offset: u64,
}

impl Segment {
    fn end(&self) -> usize {
        self.start + self.length
    }

    fn is_anonymous_writable(&self) -> bool {
        self.vnode.is_none() && self.prot.contains(Prot::WRITE)
    }
}

struct Inner {
    segments: Vec<Segment>,
    page_map: arch::ArchMap,
    limit_low: usize,
    limit_high: usize,
}

impl Inner {
    fn check_collision(&self, base: usize, length: usize) -> Option<usize> {
        let end = base + length;
        self.segments
            .iter()
            .position(|seg| end > seg.start && base < seg.end())
    }

    /// Finds the first gap of at least `length` bytes, scanning the
    /// sorted segment list and considering the trailing gap up to
    /// `limit_high`.
    fn find_space(&self, length: usize) -> KResult<usize> {
        let mut start = self.limit_low;
        for seg in &self.segments {
            if start + length <= seg.start {
                return Ok(start);
            }
            start = seg.end();
        }
        if start + length <= self.limit_high {
            Ok(start)
        } else {
            Err(Errno::ENOMEM)
        }
    }

    fn resolve_vaddr(&self, vaddr: usize, length: usize, flags: MapFlags) -> KResult<usize> {
        let out_of_range = vaddr == 0 || vaddr < self.limit_low || length > self.limit_high - vaddr;

        if out_of_range {
            if flags.intersects(MapFlags::FIXED | MapFlags::FIXED_NOREPLACE) {
                return Err(Errno::EINVAL);
            }
            return self.find_space(length);
        }

        if self.check_collision(vaddr, length).is_some() {
            if flags.contains(MapFlags::FIXED_NOREPLACE) {
                return Err(Errno::EEXIST);
            }
            if flags.contains(MapFlags::FIXED) {
                return Err(Errno::EINVAL);
            }
            return self.find_space(length);
        }

        Ok(vaddr)
    }

    fn insert_sorted(&mut self, seg: Segment) {
        let pos = self.segments.partition_point(|s| s.start < seg.start);
        self.segments.insert(pos, seg);
    }

    fn find_seg(&self, addr: usize) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|seg| seg.start <= addr && addr - seg.start < seg.length)
    }

    fn find_seg_mut(&mut self, addr: usize) -> Option<&mut Segment> {
        self.segments
            .iter_mut()
            .find(|seg| seg.start <= addr && addr - seg.start < seg.length)
    }
}

/// One process's (or the kernel's) virtual address space. One spinlock
/// guards both the segment list and the page-table writes that keep it
/// consistent.
pub struct AddressSpace {
    inner: Spin<Inner>,
}

impl AddressSpace {
    pub fn create(limit_low: usize, limit_high: usize) -> KResult<Self> {
        Ok(Self {
            inner: Spin::new(Inner {
                segments: Vec::new(),
                page_map: arch::ArchMap::map_create()?,
                limit_low,
                limit_high,
            }),
        })
    }

    /// Maps `length` bytes of `prot`/`flags` at (or near) `vaddr`.
    /// Releases the address-space lock on every exit path, including
    /// the vnode-backed one (the original's early return there skipped
    /// the unlock; this always runs it).
    pub fn map(
        &self,
        vaddr: usize,
        length: usize,
        prot: Prot,
        flags: MapFlags,
        vnode: Option<Arc<dyn MmapBacking>>,
        offset: u64,
    ) -> KResult<usize> {
        let mut inner = self.inner.lock();

        let vaddr = inner.resolve_vaddr(vaddr, length, flags)?;

        let seg = Segment {
            start: vaddr,
            length,
            prot,
            flags,
            vnode: vnode.clone(),
            offset,
        };
        inner.insert_sorted(seg);

        let result = if let Some(vn) = vnode {
            vn.mmap(self, vaddr, length, prot, flags, offset)
        } else {
            let mut mapped = 0;
            let mut result = Ok(());
            while mapped < length {
                match pm::GLOBAL.alloc(0) {
                    Some(frame) => {
                        if let Err(e) = inner.page_map.map_page(vaddr + mapped, frame.phys, PAGE_4KIB, prot) {
                            result = Err(e);
                            break;
                        }
                        // A solely-owned anonymous page starts at mapcount
                        // 1; `clone_address_space` bumps it to 2 for a
                        // 2-way COW share, so `handle_fault` can tell a
                        // still-shared frame (mapcount > 1) from one only
                        // this address space maps (mapcount == 1).
                        frame.mapcount_inc();
                    }
                    None => {
                        result = Err(Errno::ENOMEM);
                        break;
                    }
                }
                mapped += PAGE_4KIB;
            }
            result
        };

        if result.is_err() {
            inner.segments.retain(|s| s.start != vaddr || s.length != length);
        }

        result.map(|()| vaddr)
    }

    /// Removes the segment whose `(start, length)` matches exactly.
    /// Partial unmaps are out of scope.
    pub fn unmap(&self, vaddr: usize, length: usize) -> KResult<()> {
        let mut inner = self.inner.lock();

        let pos = inner
            .segments
            .iter()
            .position(|seg| seg.start == vaddr && seg.length == length)
            .ok_or(Errno::ENOENT)?;

        let mut offset = 0;
        while offset < length {
            let _ = inner.page_map.unmap_page(vaddr + offset);
            offset += PAGE_4KIB;
        }
        inner.segments.remove(pos);

        Ok(())
    }

    fn translate(&self, vaddr: usize) -> KResult<usize> {
        let inner = self.inner.lock();
        inner.page_map.vaddr_to_paddr(vaddr).ok_or(Errno::EFAULT)
    }

    /// Copies `count` bytes from `src` into this address space at
    /// `dest`, page at a time through the direct map. Fails with
    /// `EFAULT` as soon as an unmapped destination page is hit; the
    /// byte count copied so far is not reported to the caller, mirroring
    /// the original's all-or-nothing usage at call sites.
    pub fn copy_to_user(&self, dest: usize, src: &[u8]) -> KResult<()> {
        let mut i = 0;
        while i < src.len() {
            let page_off = (dest + i) % PAGE_4KIB;
            let phys = self.translate(dest + i - page_off)?;
            let len = core::cmp::min(src.len() - i, PAGE_4KIB - page_off);
            let virt = arch::phys_to_virt(phys) + page_off;
            // SAFETY: `phys` was just resolved as mapped and present;
            // the direct map covers all physical memory.
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr().add(i), virt as *mut u8, len);
            }
            i += len;
        }
        Ok(())
    }

    pub fn copy_from_user(&self, dest: &mut [u8], src: usize) -> KResult<()> {
        let mut i = 0;
        while i < dest.len() {
            let page_off = (src + i) % PAGE_4KIB;
            let phys = self.translate(src + i - page_off)?;
            let len = core::cmp::min(dest.len() - i, PAGE_4KIB - page_off);
            let virt = arch::phys_to_virt(phys) + page_off;
            unsafe {
                core::ptr::copy_nonoverlapping(virt as *const u8, dest.as_mut_ptr().add(i), len);
            }
            i += len;
        }
        Ok(())
    }

    pub fn zero_user(&self, dest: usize, count: usize) -> KResult<()> {
        let mut i = 0;
        while i < count {
            let page_off = (dest + i) % PAGE_4KIB;
            let phys = self.translate(dest + i - page_off)?;
            let len = core::cmp::min(count - i, PAGE_4KIB - page_off);
            let virt = arch::phys_to_virt(phys) + page_off;
            unsafe {
                core::ptr::write_bytes(virt as *mut u8, 0, len);
            }
            i += len;
        }
        Ok(())
    }

    /// Copy-on-write clone (resolves design note (c)): anonymous
    /// writable segments are duplicated and re-mapped read-only in
    /// both parent and child with the shared frame's mapcount bumped;
    /// shared/vnode-backed segments are shared by reference;
    /// private vnode-backed segments (no COW discipline with the
    /// backing store) are deep-copied page by page.
    pub fn clone_address_space(&self) -> KResult<Self> {
        let mut parent = self.inner.lock();
        let child = Self::create(parent.limit_low, parent.limit_high)?;

        for i in 0..parent.segments.len() {
            let (start, length, prot, flags, vnode, offset) = {
                let seg = &parent.segments[i];
                (seg.start, seg.length, seg.prot, seg.flags, seg.vnode.clone(), seg.offset)
            };

            match &vnode {
                Some(_) if flags.contains(MapFlags::SHARED) => {
                    child.map(start, length, prot, flags, vnode, offset)?;
                }
                Some(vn) => {
                    // Private vnode-backed: deep copy, page by page.
                    let vn = vn.clone();
                    child.map(start, length, prot, flags, Some(vn), offset)?;
                    let mut buf = alloc::vec![0u8; length];
                    parent.page_map_copy_out(start, &mut buf)?;
                    child.copy_to_user(start, &buf)?;
                }
                None if parent.segments[i].is_anonymous_writable() => {
                    let child_start = child.map(
                        start,
                        length,
                        prot & !Prot::WRITE,
                        flags,
                        None,
                        0,
                    )?;
                    debug_assert_eq!(child_start, start);

                    let mut off = 0;
                    while off < length {
                        let vaddr = start + off;
                        if let Some(phys) = parent.page_map.vaddr_to_paddr(vaddr) {
                            let frame = pm::GLOBAL.phys_to_page(phys);
                            frame.mapcount_inc();
                            let _ = parent.page_map.unmap_page(vaddr);
                            parent
                                .page_map
                                .map_page(vaddr, phys, PAGE_4KIB, prot & !Prot::WRITE)
                                .ok();
                            let mut child_inner = child.inner.lock();
                            let _ = child_inner.page_map.unmap_page(vaddr);
                            child_inner
                                .page_map
                                .map_page(vaddr, phys, PAGE_4KIB, prot & !Prot::WRITE)
                                .ok();
                        }
                        off += PAGE_4KIB;
                    }
                }
                None => {
                    child.map(start, length, prot, flags, None, 0)?;
                }
            }
        }

        drop(parent);
        Ok(child)
    }

    /// Resolves a page fault at `vaddr` within a COW segment: if the
    /// underlying frame's mapcount has dropped back to 1 (no longer
    /// shared), the fault is resolved in place by re-mapping writable;
    /// otherwise a fresh frame is allocated, the old contents copied,
    /// and the new frame mapped in its place.
    pub fn handle_fault(&self, vaddr: usize) -> KResult<()> {
        let mut inner = self.inner.lock();
        let page_base = pm_page_size_align(vaddr);

        let seg_prot = inner.find_seg(vaddr).map(|s| s.prot).ok_or(Errno::EFAULT)?;
        if !seg_prot.contains(Prot::WRITE) {
            return Err(Errno::EFAULT);
        }

        let phys = inner.page_map.vaddr_to_paddr(page_base).ok_or(Errno::EFAULT)?;
        let frame = pm::GLOBAL.phys_to_page(phys);

        if frame.mapcount() <= 1 {
            inner.page_map.unmap_page(page_base)?;
            inner.page_map.map_page(page_base, phys, PAGE_4KIB, seg_prot)?;
            return Ok(());
        }

        let new_frame = pm::GLOBAL.alloc(0).ok_or(Errno::ENOMEM)?;
        let src_virt = arch::phys_to_virt(phys);
        let dst_virt = arch::phys_to_virt(new_frame.phys);
        unsafe {
            core::ptr::copy_nonoverlapping(src_virt as *const u8, dst_virt as *mut u8, PAGE_4KIB);
        }
        frame.mapcount_dec();

        inner.page_map.unmap_page(page_base)?;
        inner
            .page_map
            .map_page(page_base, new_frame.phys, PAGE_4KIB, seg_prot)?;

        Ok(())
    }

    pub fn load(&self) {
        self.inner.lock().page_map.load();
    }

    /// Installs a mapping directly, bypassing segment bookkeeping; used
    /// by kernel bring-up's identity/direct-map mappings.
    pub fn map_raw(&self, vaddr: usize, paddr: usize, size: usize, prot: Prot) -> KResult<()> {
        self.inner.lock().page_map.map_page(vaddr, paddr, size, prot)
    }

    /// Builds an address space with a zeroed page map, for host tests
    /// (process/scheduler bookkeeping, mostly) that need *an*
    /// `AddressSpace` to hang a process off of but never walk its
    /// tables or touch [`pm::GLOBAL`].
    #[cfg(test)]
    pub fn create_for_test() -> Self {
        Self {
            inner: Spin::new(Inner {
                segments: Vec::new(),
                page_map: unsafe { core::mem::zeroed() },
                limit_low: 0x1000,
                limit_high: 0x8000_0000,
            }),
        }
    }
}

impl Inner {
    fn page_map_copy_out(&self, start: usize, buf: &mut [u8]) -> KResult<()> {
        let mut i = 0;
        while i < buf.len() {
            let page_off = (start + i) % PAGE_4KIB;
            let phys = self
                .page_map
                .vaddr_to_paddr(start + i - page_off)
                .ok_or(Errno::EFAULT)?;
            let len = core::cmp::min(buf.len() - i, PAGE_4KIB - page_off);
            let virt = arch::phys_to_virt(phys) + page_off;
            unsafe {
                core::ptr::copy_nonoverlapping(virt as *const u8, buf.as_mut_ptr().add(i), len);
            }
            i += len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: usize, length: usize) -> Segment {
        Segment {
            start,
            length,
            prot: Prot::empty(),
            flags: MapFlags::empty(),
            vnode: None,
            offset: 0,
        }
    }

    #[test]
    fn find_space_prefers_first_gap() {
        let mut inner = Inner {
            segments: Vec::new(),
            page_map: unsafe { core::mem::zeroed() },
            limit_low: 0x1000,
            limit_high: 0x10000,
        };
        inner.segments.push(seg(0x2000, 0x1000));
        inner.segments.push(seg(0x5000, 0x1000));
        assert_eq!(inner.find_space(0x1000).unwrap(), 0x1000);
        assert_eq!(inner.find_space(0x3000).unwrap(), 0x6000);
    }
}
