//! A RAMFS instance mounted at `/dev`, augmented with device
//! registration: a registered device gets a vnode of the requested
//! type backed by caller-supplied ops instead of the plain RAMFS ones.
//! Grounded in the original kernel's `fs/devfs.c`.

use crate::prelude::*;
use crate::vfs::{VType, Vfs, Vnode, VnodeOps};

struct DevfsRoot {
    children: Vec<(String, Arc<Vnode>)>,
}

struct DevfsRootOps;

impl VnodeOps for DevfsRootOps {
    fn lookup(&self, vn: &Arc<Vnode>, name: &str) -> KResult<Arc<Vnode>> {
        vn.with_private::<DevfsRoot, _>(|data| match name {
            "." | ".." => Ok(vn.clone()),
            _ => data
                .children
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, child)| child.clone())
                .ok_or(Errno::ENOENT),
        })
    }

    fn readdir(&self, vn: &Vnode, index: usize) -> KResult<Option<crate::vfs::DirEntry>> {
        Ok(vn.with_private::<DevfsRoot, _>(|data| {
            data.children.get(index).map(|(name, child)| crate::vfs::DirEntry {
                name: name.clone(),
                vtype: child.vtype,
            })
        }))
    }
}

static mut DEVFS_ROOT: Option<Arc<Vnode>> = None;

fn root() -> Arc<Vnode> {
    // SAFETY: written once by `init`, before any call to `register_device`
    // or a lookup through `/dev` can race it.
    unsafe { DEVFS_ROOT.clone().expect("devfs: used before init") }
}

struct DevfsVfs {
    root: Arc<Vnode>,
}

impl Vfs for DevfsVfs {
    fn name(&self) -> &str {
        "devfs"
    }

    fn get_root(&self) -> KResult<Arc<Vnode>> {
        Ok(self.root.clone())
    }
}

/// Mounts a fresh DevFS at `/dev`.
pub fn init() -> KResult<()> {
    let root = Vnode::new(
        "/",
        VType::Directory,
        0,
        Arc::new(DevfsRootOps),
        Box::new(DevfsRoot { children: Vec::new() }),
    );
    // SAFETY: runs once during single-threaded boot, before any reader.
    unsafe {
        DEVFS_ROOT = Some(root.clone());
    }
    crate::vfs::mount::mount("/dev", Arc::new(DevfsVfs { root }), 0)?;
    println_info!("DevFS initialized.");
    Ok(())
}

/// Registers a device node named `name` under `/dev`, backed by `ops`.
pub fn register_device(name: &str, vtype: VType, ops: Arc<dyn VnodeOps>, private: Box<dyn core::any::Any + Send + Sync>) -> KResult<Arc<Vnode>> {
    let root = root();
    let node = Vnode::new(name, vtype, 0, ops, private);
    root.with_private::<DevfsRoot, _>(|data| {
        if data.children.iter().any(|(n, _)| n == name) {
            return Err(Errno::EEXIST);
        }
        data.children.push((name.to_string(), node.clone()));
        Ok(())
    })?;
    Ok(node)
}

/// Removes a previously registered device node.
pub fn unregister_device(name: &str) -> KResult<()> {
    let root = root();
    root.with_private::<DevfsRoot, _>(|data| {
        let pos = data.children.iter().position(|(n, _)| n == name).ok_or(Errno::ENOENT)?;
        data.children.remove(pos);
        Ok(())
    })
}

/// A device that stores no data of its own, used by unit tests to
/// exercise registration without a real driver.
#[cfg(test)]
struct NullOps;
#[cfg(test)]
impl VnodeOps for NullOps {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_then_unregister() {
        init().unwrap();
        register_device("null", VType::Char, Arc::new(NullOps), Box::new(())).unwrap();

        let found = root().ops.clone().lookup(&root(), "null").unwrap();
        assert_eq!(found.vtype, VType::Char);

        unregister_device("null").unwrap();
        assert_eq!(root().ops.clone().lookup(&root(), "null").unwrap_err(), Errno::ENOENT);
    }
}
