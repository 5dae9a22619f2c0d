//! Virtual filesystem core: vnode graph, per-vnode page cache, the
//! path-lookup/create/remove veneer, and dirty-page writeback.
//! Grounded in the original kernel's `fs/vfs.h` / `fs/vfs.c`.

pub mod devfs;
pub mod mount;
pub mod ramfs;

use core::any::Any;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::mm::arch::Prot;
use crate::mm::vm::{AddressSpace, MapFlags, MmapBacking};
use crate::mm::PAGE_4KIB;
use crate::prelude::*;

use spinlock::Spin;
use xarray::XArray;

pub use mount::find_mount;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VType {
    None,
    Regular,
    Directory,
    Block,
    Char,
    Symlink,
    Socket,
    Bad,
}

pub struct DirEntry {
    pub name: String,
    pub vtype: VType,
}

/// The capability set every filesystem implements against, stored as
/// one vtable per vnode. Absent behavior fails `ENOTSUP`; the two page
/// primitives default to "this page cache is the only copy of the
/// data" (zero-fill on first read, nothing to flush on write), which
/// holds for every filesystem this kernel core ships (RAMFS, DevFS).
pub trait VnodeOps: Send + Sync {
    fn read_raw(&self, _vn: &Vnode, _page_index: u64, buf: &mut [u8]) -> KResult<()> {
        buf.fill(0);
        Ok(())
    }

    fn write_raw(&self, _vn: &Vnode, _page_index: u64, _buf: &[u8]) -> KResult<()> {
        Ok(())
    }

    fn lookup(&self, _vn: &Arc<Vnode>, _name: &str) -> KResult<Arc<Vnode>> {
        Err(Errno::ENOTSUP)
    }

    fn create(&self, _vn: &Arc<Vnode>, _name: &str, _vtype: VType) -> KResult<Arc<Vnode>> {
        Err(Errno::ENOTSUP)
    }

    fn remove(&self, _vn: &Arc<Vnode>, _name: &str) -> KResult<()> {
        Err(Errno::ENOTSUP)
    }

    fn readdir(&self, _vn: &Vnode, _index: usize) -> KResult<Option<DirEntry>> {
        Err(Errno::ENOTSUP)
    }

    fn ioctl(&self, _vn: &Vnode, _cmd: u64, _arg: usize) -> KResult<usize> {
        Err(Errno::ENOTSUP)
    }

    fn mmap(
        &self,
        _vn: &Vnode,
        _as_: &AddressSpace,
        _vaddr: usize,
        _length: usize,
        _prot: Prot,
        _flags: MapFlags,
        _offset: u64,
    ) -> KResult<()> {
        Err(Errno::ENOTSUP)
    }
}

pub struct Vnode {
    name: Spin<String>,
    pub vtype: VType,
    pub perm: u32,
    ctime: AtomicU64,
    mtime: AtomicU64,
    atime: AtomicU64,
    size: AtomicU64,
    pages: Spin<XArray<&'static pm::PageFrame>>,
    pub ops: Arc<dyn VnodeOps>,
    private: Spin<Box<dyn Any + Send + Sync>>,
    refcount: AtomicUsize,
}

/// The dirty mark used in the per-vnode page xarray (SPEC_FULL.md §4.4).
const MARK_DIRTY: usize = 0;

impl Vnode {
    pub fn new(name: &str, vtype: VType, perm: u32, ops: Arc<dyn VnodeOps>, private: Box<dyn Any + Send + Sync>) -> Arc<Self> {
        Arc::new(Self {
            name: Spin::new(name.to_string()),
            vtype,
            perm,
            ctime: AtomicU64::new(0),
            mtime: AtomicU64::new(0),
            atime: AtomicU64::new(0),
            size: AtomicU64::new(0),
            pages: Spin::new(XArray::new()),
            ops,
            private: Spin::new(private),
            refcount: AtomicUsize::new(1),
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn rename(&self, new_name: &str) {
        *self.name.lock() = new_name.to_string();
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn touch_atime(&self, now: u64) {
        self.atime.store(now, Ordering::Relaxed);
    }

    pub fn touch_mtime(&self, now: u64) {
        self.mtime.store(now, Ordering::Relaxed);
        self.ctime.store(now, Ordering::Relaxed);
    }

    pub fn with_private<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.private.lock();
        let data = guard
            .downcast_mut::<T>()
            .expect("vfs: vnode private data type mismatch");
        f(data)
    }

    pub fn ref_(self: &Arc<Self>) -> Arc<Self> {
        self.refcount.fetch_add(1, Ordering::Relaxed);
        self.clone()
    }

    /// Drops a reference; the last one runs `writeback` as the original's
    /// `vnode_unref` destructor hook would before freeing the vnode.
    pub fn unref(self: Arc<Self>) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = writeback(&self);
        }
    }

    fn get_page(self: &Arc<Self>, pg_idx: u64, read: bool) -> KResult<&'static pm::PageFrame> {
        if let Some(frame) = self.pages.lock().get(pg_idx as usize) {
            return Ok(*frame);
        }

        let frame = pm::GLOBAL.alloc(0).ok_or(Errno::ENOMEM)?;

        if read {
            let virt = crate::mm::arch::phys_to_virt(frame.phys);
            // SAFETY: `frame` was just allocated, exclusively owned here,
            // and is exactly one page long.
            let buf = unsafe { core::slice::from_raw_parts_mut(virt as *mut u8, PAGE_4KIB) };
            if let Err(e) = self.ops.read_raw(self, pg_idx, buf) {
                pm::GLOBAL.free(frame);
                return Err(e);
            }
        }

        self.pages.lock().insert(pg_idx as usize, frame);
        Ok(frame)
    }
}

impl MmapBacking for Vnode {
    fn mmap(
        &self,
        as_: &AddressSpace,
        vaddr: usize,
        length: usize,
        prot: Prot,
        flags: MapFlags,
        offset: u64,
    ) -> KResult<()> {
        self.ops.mmap(self, as_, vaddr, length, prot, flags, offset)
    }
}

/// Page-cache-aware read (SPEC_FULL.md §4.4). Copies `buf.len()` bytes
/// starting at `offset`, stopping short (returning the count copied so
/// far) the first time a page is missing from the backing store.
pub fn read(vn: &Arc<Vnode>, offset: u64, buf: &mut [u8]) -> KResult<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let pos = offset + total as u64;
        let pg_idx = pos / PAGE_4KIB as u64;
        let pg_off = (pos % PAGE_4KIB as u64) as usize;
        let to_copy = core::cmp::min(PAGE_4KIB - pg_off, buf.len() - total);

        let frame = vn.get_page(pg_idx, true)?;
        let virt = crate::mm::arch::phys_to_virt(frame.phys);
        // SAFETY: `frame` is a live page owned by this vnode's cache.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (virt + pg_off) as *const u8,
                buf.as_mut_ptr().add(total),
                to_copy,
            );
        }
        total += to_copy;
    }
    Ok(total)
}

/// Page-cache-aware write (SPEC_FULL.md §4.4): marks every touched page
/// dirty and extends `vn.size` past the end of the write.
pub fn write(vn: &Arc<Vnode>, offset: u64, buf: &[u8]) -> KResult<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let pos = offset + total as u64;
        let pg_idx = pos / PAGE_4KIB as u64;
        let pg_off = (pos % PAGE_4KIB as u64) as usize;
        let to_copy = core::cmp::min(PAGE_4KIB - pg_off, buf.len() - total);

        // Read-modify-write only when the page isn't being overwritten whole.
        let need_read = !(pg_off == 0 && to_copy == PAGE_4KIB);
        let frame = vn.get_page(pg_idx, need_read)?;
        let virt = crate::mm::arch::phys_to_virt(frame.phys);
        unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr().add(total),
                (virt + pg_off) as *mut u8,
                to_copy,
            );
        }
        vn.pages.lock().set_mark(pg_idx as usize, MARK_DIRTY);
        total += to_copy;
    }

    let end = offset + total as u64;
    if end > vn.size() {
        vn.size.store(end, Ordering::Release);
    }
    Ok(total)
}

/// Flushes dirty pages back to the backing store (resolves SPEC_FULL.md
/// §9 "Dirty page writeback"): iterates the per-vnode xarray by the
/// dirty mark and calls `write_raw` for each, clearing the mark on
/// success.
pub fn writeback(vn: &Vnode) -> KResult<()> {
    let mut pages = vn.pages.lock();
    let mut idx = 0usize;
    while let Some((found_idx, frame)) = pages.find_mark(idx, MARK_DIRTY) {
        let frame = *frame;
        let virt = crate::mm::arch::phys_to_virt(frame.phys);
        let buf = unsafe { core::slice::from_raw_parts(virt as *const u8, PAGE_4KIB) };
        vn.ops.write_raw(vn, found_idx as u64, buf)?;
        pages.clear_mark(found_idx, MARK_DIRTY);
        idx = found_idx + 1;
    }
    Ok(())
}

pub fn ioctl(vn: &Vnode, cmd: u64, arg: usize) -> KResult<usize> {
    vn.ops.ioctl(vn, cmd, arg)
}

pub fn mmap(
    vn: &Arc<Vnode>,
    as_: &AddressSpace,
    vaddr: usize,
    length: usize,
    prot: Prot,
    flags: MapFlags,
    offset: u64,
) -> KResult<()> {
    vn.ops.mmap(vn, as_, vaddr, length, prot, flags, offset)
}

/// Walks an absolute path from its mount's root, one component at a
/// time, via `ops.lookup`.
pub fn lookup(path: &str) -> KResult<Arc<Vnode>> {
    debug_assert!(crate::path::is_absolute(path));

    let (mnt, rest) = mount::find_mount(path);
    let mut curr = mnt.vfs.get_root()?;

    for component in crate::path::components(rest) {
        curr = curr.ops.clone().lookup(&curr, component).map_err(|_| Errno::ENOENT)?;
    }

    Ok(curr)
}

pub fn create(path: &str, vtype: VType) -> KResult<Arc<Vnode>> {
    debug_assert!(crate::path::is_absolute(path));

    let (dirname, basename) = crate::path::split(path);
    let parent = lookup(dirname)?;
    parent.ops.clone().create(&parent, basename, vtype)
}

pub fn remove(path: &str) -> KResult<()> {
    debug_assert!(crate::path::is_absolute(path));

    let (dirname, basename) = crate::path::split(path);
    let parent = lookup(dirname)?;
    parent.ops.clone().remove(&parent, basename)
}

/// What every mounted filesystem provides: a way to reach its root
/// vnode. Grounded in the original's `vfs_ops_t { get_root }`.
pub trait Vfs: Send + Sync {
    fn name(&self) -> &str;
    fn get_root(&self) -> KResult<Arc<Vnode>>;
}

/// Brings up the root filesystem: a fresh RAMFS mounted at `/`.
pub fn init() -> KResult<()> {
    let root_fs = ramfs::create("ramfs");
    mount::init(root_fs)?;
    println_info!("VFS initialized.");
    Ok(())
}
