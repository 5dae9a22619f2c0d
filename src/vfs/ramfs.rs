//! In-memory filesystem used for the root filesystem and, via
//! [`crate::vfs::devfs`], for `/dev`. Grounded in the original kernel's
//! `fs/ramfs.h` / `fs/ramfs.c`; the per-node page list described there
//! is folded into the single per-vnode page cache every vnode already
//! carries (SPEC_FULL.md §4.5's "sparse per-vnode page index"), so
//! `RamfsOps` only needs to track the directory tree.

use crate::prelude::*;
use crate::vfs::{DirEntry, VType, Vfs, Vnode, VnodeOps};

struct RamfsData {
    parent: Option<Arc<Vnode>>,
    children: Vec<(String, Arc<Vnode>)>,
}

struct RamfsOps;

impl VnodeOps for RamfsOps {
    fn lookup(&self, vn: &Arc<Vnode>, name: &str) -> KResult<Arc<Vnode>> {
        if vn.vtype != VType::Directory {
            return Err(Errno::ENOTDIR);
        }
        vn.with_private::<RamfsData, _>(|data| match name {
            "." => Ok(vn.clone()),
            ".." => Ok(data.parent.clone().unwrap_or_else(|| vn.clone())),
            _ => data
                .children
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, child)| child.clone())
                .ok_or(Errno::ENOENT),
        })
    }

    fn create(&self, vn: &Arc<Vnode>, name: &str, vtype: VType) -> KResult<Arc<Vnode>> {
        if vn.vtype != VType::Directory {
            return Err(Errno::ENOTDIR);
        }
        let child = Vnode::new(
            name,
            vtype,
            0,
            Arc::new(RamfsOps),
            Box::new(RamfsData {
                parent: Some(vn.clone()),
                children: Vec::new(),
            }),
        );
        vn.with_private::<RamfsData, _>(|data| data.children.push((name.to_string(), child.clone())));
        Ok(child)
    }

    fn remove(&self, vn: &Arc<Vnode>, name: &str) -> KResult<()> {
        vn.with_private::<RamfsData, _>(|data| {
            let pos = data.children.iter().position(|(n, _)| n == name).ok_or(Errno::ENOENT)?;
            let (_, child) = data.children.remove(pos);
            remove_recursive(&child);
            Ok(())
        })
    }

    fn readdir(&self, vn: &Vnode, index: usize) -> KResult<Option<DirEntry>> {
        if vn.vtype != VType::Directory {
            return Err(Errno::ENOTDIR);
        }
        Ok(vn.with_private::<RamfsData, _>(|data| {
            data.children.get(index).map(|(name, child)| DirEntry {
                name: name.clone(),
                vtype: child.vtype,
            })
        }))
    }
}

/// Unlinks every descendant of `vn` before it is dropped, mirroring the
/// original's recursive `remove`.
fn remove_recursive(vn: &Arc<Vnode>) {
    if vn.vtype != VType::Directory {
        return;
    }
    let children: Vec<Arc<Vnode>> = vn.with_private::<RamfsData, _>(|data| {
        core::mem::take(&mut data.children).into_iter().map(|(_, c)| c).collect()
    });
    for child in children {
        remove_recursive(&child);
    }
}

struct RamfsVfs {
    name: String,
    root: Arc<Vnode>,
}

impl Vfs for RamfsVfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_root(&self) -> KResult<Arc<Vnode>> {
        Ok(self.root.clone())
    }
}

/// Creates a fresh RAMFS instance named `name`, with an empty root
/// directory that is its own parent (`..` at the root resolves to
/// itself).
pub fn create(name: &str) -> Arc<dyn Vfs> {
    let root = Vnode::new(
        "/",
        VType::Directory,
        0,
        Arc::new(RamfsOps),
        Box::new(RamfsData {
            parent: None,
            children: Vec::new(),
        }),
    );

    Arc::new(RamfsVfs {
        name: name.to_string(),
        root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // S2 from SPEC_FULL.md §8.
    #[test]
    fn s2_create_write_read() {
        let fs = create("ramfs");
        let root = fs.get_root().unwrap();
        let file = root.ops.clone().create(&root, "a.txt", VType::Regular).unwrap();

        let n = crate::vfs::write(&file, 0, b"hello").unwrap();
        assert_eq!(n, 5);

        let mut buf = [0u8; 5];
        let m = crate::vfs::read(&file, 0, &mut buf).unwrap();
        assert_eq!(m, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(file.size(), 5);
    }

    #[test]
    fn dot_and_dotdot_resolve() {
        let fs = create("ramfs");
        let root = fs.get_root().unwrap();
        let dir = root.ops.clone().create(&root, "sub", VType::Directory).unwrap();

        assert!(Arc::ptr_eq(&dir.ops.clone().lookup(&dir, ".").unwrap(), &dir));
        assert!(Arc::ptr_eq(&dir.ops.clone().lookup(&dir, "..").unwrap(), &root));
    }

    #[test]
    fn remove_unlinks_subtree() {
        let fs = create("ramfs");
        let root = fs.get_root().unwrap();
        let dir = root.ops.clone().create(&root, "sub", VType::Directory).unwrap();
        dir.ops.clone().create(&dir, "leaf", VType::Regular).unwrap();

        root.ops.clone().remove(&root, "sub").unwrap();
        assert_eq!(root.ops.clone().lookup(&root, "sub").unwrap_err(), Errno::ENOENT);
    }
}
