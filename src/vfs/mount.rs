//! The mount trie: a component-keyed prefix tree giving longest-match
//! lookup of which filesystem covers a path. Grounded in the original
//! kernel's `fs/mount.h` / `fs/mount.c`, whose fixed 16-way hashed
//! children array is replaced here with a `BTreeMap` keyed directly by
//! component string -- same lookup contract, no collision handling
//! needed.

use alloc::collections::BTreeMap;
use alloc::string::String;

use crate::prelude::*;
use crate::vfs::{Vfs, Vnode};

use spinlock::Spin;

pub struct Mount {
    pub vfs: Arc<dyn Vfs>,
    pub covered: Option<Arc<Vnode>>,
    pub flags: u32,
}

struct TrieNode {
    children: BTreeMap<String, TrieNode>,
    mount: Option<Arc<Mount>>,
}

impl TrieNode {
    const fn new() -> Self {
        Self {
            children: BTreeMap::new(),
            mount: None,
        }
    }
}

static ROOT: Spin<TrieNode> = Spin::new(TrieNode::new());

/// Mounts `vfs` at `path`, creating any missing intermediate trie nodes.
/// Fails `EBUSY` if a mount is already installed at that exact node.
pub fn mount(path: &str, vfs: Arc<dyn Vfs>, flags: u32) -> KResult<()> {
    let mut root = ROOT.lock();
    let mut node = &mut *root;
    for component in crate::path::components(path) {
        node = node
            .children
            .entry(component.to_string())
            .or_insert_with(TrieNode::new);
    }

    if node.mount.is_some() {
        return Err(Errno::EBUSY);
    }
    node.mount = Some(Arc::new(Mount {
        vfs,
        covered: None,
        flags,
    }));
    Ok(())
}

/// Descends the trie while `path`'s components match, remembering the
/// deepest node that carries a mount. Returns that mount and the
/// remainder of `path` past its matched prefix.
pub fn find_mount(path: &str) -> (Arc<Mount>, &str) {
    let root = ROOT.lock();

    let mut node = &*root;
    let mut rest = path;
    let mut best = node.mount.clone();
    let mut best_rest = path.trim_start_matches('/');

    loop {
        let (component, tail) = crate::path::next_component(rest);
        if component.is_empty() {
            break;
        }
        match node.children.get(component) {
            Some(child) => {
                node = child;
                rest = tail;
                if let Some(m) = &node.mount {
                    best = Some(m.clone());
                    best_rest = tail.trim_start_matches('/');
                }
            }
            None => break,
        }
    }

    (best.expect("mount: find_mount called before the root filesystem was mounted"), best_rest)
}

/// Mounts the root filesystem. Must run exactly once, before any
/// lookup.
pub fn init(root_vfs: Arc<dyn Vfs>) -> KResult<()> {
    mount("/", root_vfs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ramfs;

    // S3 from SPEC_FULL.md §8.
    #[test]
    fn s3_longest_prefix_match() {
        mount("/", ramfs::create("ramfs-A"), 0).ok();
        mount("/dev", ramfs::create("ramfs-B"), 0).ok();

        let (m, rest) = find_mount("/dev/null");
        assert_eq!(m.vfs.name(), "ramfs-B");
        assert_eq!(rest, "null");

        let (m, rest) = find_mount("/home");
        assert_eq!(m.vfs.name(), "ramfs-A");
        assert_eq!(rest, "home");
    }
}
