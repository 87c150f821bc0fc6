//! The immutable inode tree.
//!
//! Built once by the preloader, frozen before the filesystem is handed to
//! the kernel.  Directories carry nothing but their children; each file
//! node owns the enclave sealing its plaintext, its resolved attributes,
//! and the mutex that serialises enclave opens for that file.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use fuser::{FileAttr, FileType, INodeNo};

use gpgfs_core::Enclave;

use crate::attr::NodeAttr;

pub const ROOT_INO: u64 = 1;

/// A leaf: one decrypted file.
pub struct FileNode {
    content: Enclave,
    attr: NodeAttr,
    /// Serialises the open → hand-off pairing on this file.  Taken by
    /// `getattr` and `read`; never held across a reply.
    lock: Mutex<()>,
}

impl FileNode {
    pub fn new(content: Enclave, attr: NodeAttr) -> Self {
        Self { content, attr, lock: Mutex::new(()) }
    }

    pub fn content(&self) -> &Enclave {
        &self.content
    }

    pub fn attr(&self) -> NodeAttr {
        self.attr
    }

    pub fn lock(&self) -> &Mutex<()> {
        &self.lock
    }
}

enum Node {
    Dir,
    File(FileNode),
}

/// The frozen tree: inode → node plus per-directory child lists.
pub struct Tree {
    nodes: HashMap<u64, Node>,
    /// Children of each directory inode: `(name, ino, is_dir)`.
    children: HashMap<u64, Vec<(String, u64, bool)>>,
}

impl Tree {
    pub fn is_dir(&self, ino: u64) -> bool {
        matches!(self.nodes.get(&ino), Some(Node::Dir))
    }

    pub fn file(&self, ino: u64) -> Option<&FileNode> {
        match self.nodes.get(&ino) {
            Some(Node::File(node)) => Some(node),
            _ => None,
        }
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Option<u64> {
        self.children
            .get(&parent)?
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, ino, _)| *ino)
    }

    pub fn children(&self, ino: u64) -> Option<&[(String, u64, bool)]> {
        self.children.get(&ino).map(Vec::as_slice)
    }

    /// Walk a `/`-separated path from the root.  Test and tooling helper;
    /// the kernel drives per-component `lookup` itself.
    pub fn resolve(&self, path: &str) -> Option<u64> {
        let mut ino = ROOT_INO;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            ino = self.lookup(ino, component)?;
        }
        Some(ino)
    }

    pub fn file_count(&self) -> u64 {
        self.nodes
            .values()
            .filter(|n| matches!(n, Node::File(_)))
            .count() as u64
    }

    /// Attributes for a directory inode.  File attributes are assembled on
    /// the request path, where the enclave is open and the size is known.
    pub fn dir_attr(&self, ino: u64) -> Option<FileAttr> {
        if !self.is_dir(ino) {
            return None;
        }
        let owner = NodeAttr::default();
        Some(make_attr(ino, FileType::Directory, 0o555, owner.uid, owner.gid, 4096))
    }
}

pub(crate) fn make_attr(
    ino: u64,
    kind: FileType,
    perm: u16,
    uid: u32,
    gid: u32,
    size: u64,
) -> FileAttr {
    FileAttr {
        ino: INodeNo(ino),
        size,
        blocks: size.div_ceil(512),
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind,
        perm,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// Single-threaded builder used by the preloader.
pub struct TreeBuilder {
    nodes: HashMap<u64, Node>,
    children: HashMap<u64, Vec<(String, u64, bool)>>,
    next_ino: u64,
}

impl TreeBuilder {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::Dir);
        let mut children = HashMap::new();
        children.insert(ROOT_INO, Vec::new());
        Self { nodes, children, next_ino: ROOT_INO + 1 }
    }

    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    /// Return the child named `name` under `parent`, creating a directory
    /// inode if absent.  The boolean reports whether a node was created.
    pub fn ensure_dir(&mut self, parent: u64, name: &str) -> (u64, bool) {
        if let Some(existing) = self
            .children
            .get(&parent)
            .and_then(|v| v.iter().find(|(n, _, _)| n == name))
        {
            return (existing.1, false);
        }
        let ino = self.alloc_ino();
        self.nodes.insert(ino, Node::Dir);
        self.children.insert(ino, Vec::new());
        self.children
            .entry(parent)
            .or_default()
            .push((name.to_string(), ino, true));
        (ino, true)
    }

    /// Attach a file node at `name` under `parent`.
    ///
    /// An existing child wins: the first entry mounted at a path keeps it,
    /// matching the deterministic walk order.
    pub fn add_file(&mut self, parent: u64, name: &str, node: FileNode) -> u64 {
        if let Some(existing) = self
            .children
            .get(&parent)
            .and_then(|v| v.iter().find(|(n, _, _)| n == name))
        {
            return existing.1;
        }
        let ino = self.alloc_ino();
        self.nodes.insert(ino, Node::File(node));
        self.children
            .entry(parent)
            .or_default()
            .push((name.to_string(), ino, false));
        ino
    }

    /// Freeze the tree.  No mutation is possible afterwards.
    pub fn finish(self) -> Tree {
        Tree { nodes: self.nodes, children: self.children }
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_node(content: &[u8]) -> FileNode {
        FileNode::new(Enclave::new(content.to_vec()).unwrap(), NodeAttr::default())
    }

    #[test]
    fn builds_nested_directories_once() {
        let mut builder = TreeBuilder::new();
        let (a, created_a) = builder.ensure_dir(ROOT_INO, "a");
        let (b, created_b) = builder.ensure_dir(a, "b");
        let (a2, created_again) = builder.ensure_dir(ROOT_INO, "a");
        assert!(created_a && created_b);
        assert!(!created_again);
        assert_eq!(a, a2);

        let file = builder.add_file(b, "secret", file_node(b"x"));
        let tree = builder.finish();
        assert_eq!(tree.resolve("a/b/secret"), Some(file));
        assert!(tree.is_dir(a));
        assert!(tree.is_dir(b));
        assert!(tree.file(file).is_some());
        assert_eq!(tree.file_count(), 1);
    }

    #[test]
    fn first_file_at_a_path_wins() {
        let mut builder = TreeBuilder::new();
        let first = builder.add_file(ROOT_INO, "dup", file_node(b"first"));
        let second = builder.add_file(ROOT_INO, "dup", file_node(b"second"));
        assert_eq!(first, second);
        let tree = builder.finish();
        let buf = tree.file(first).unwrap().content().open().unwrap();
        assert_eq!(buf.bytes(), b"first");
    }

    #[test]
    fn lookup_misses_return_none() {
        let tree = TreeBuilder::new().finish();
        assert_eq!(tree.lookup(ROOT_INO, "nope"), None);
        assert_eq!(tree.resolve("deep/down"), None);
        assert!(tree.file(ROOT_INO).is_none());
        assert!(tree.dir_attr(99).is_none());
    }

    #[test]
    fn dir_attr_shape() {
        let tree = TreeBuilder::new().finish();
        let attr = tree.dir_attr(ROOT_INO).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o555);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.mtime, UNIX_EPOCH);
    }
}
