//! The FUSE surface over a preloaded tree.
//!
//! Everything the kernel sees comes from the frozen [`Tree`]: directories
//! answer lookups and listings from their child tables, files briefly
//! unseal their enclave per request.  A file is in one of two states —
//! idle (no outstanding buffer) or in-flight (exactly one [`ReadResult`]
//! awaiting completion) — and the per-file mutex keeps the transition from
//! racing with another operation on the same file.  The filesystem is
//! read-only: writes and attribute changes answer `ENOSYS`.

use std::ffi::OsStr;
use std::time::Duration;

use fuser::{
    AccessFlags, Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags, Generation,
    INodeNo, LockOwner, OpenFlags, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, error};

use gpgfs_core::LockedBuffer;

use crate::tree::{FileNode, Tree, make_attr};

const TTL: Duration = Duration::from_secs(1);

/// A read in flight.
///
/// Owns the locked buffer backing the reply slice.  The value is move-only
/// and its drop — after the reply bytes have been handed to the kernel —
/// zeroes and unmaps the buffer.  That drop is the completion hook, and
/// ownership guarantees it runs exactly once per read.
pub struct ReadResult {
    buf: LockedBuffer,
    start: usize,
    end: usize,
}

impl ReadResult {
    pub(crate) fn new(buf: LockedBuffer, offset: u64, size: u32) -> Self {
        let len = buf.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size as usize).min(len);
        Self { buf, start, end }
    }

    /// The bounded reply slice.  Valid until the result is dropped.
    pub fn bytes(&self) -> &[u8] {
        &self.buf.bytes()[self.start..self.end]
    }
}

/// The filesystem object handed to `fuser`.
pub struct GpgFs {
    tree: Tree,
}

impl GpgFs {
    pub fn new(tree: Tree) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Attributes for any inode.
    ///
    /// For files this opens the enclave under the per-file lock to learn
    /// the plaintext size, and destroys the buffer before returning — the
    /// idle → idle path.
    fn attr_of(&self, ino: u64) -> Result<FileAttr, Errno> {
        if let Some(attr) = self.tree.dir_attr(ino) {
            return Ok(attr);
        }
        let node = self.tree.file(ino).ok_or(Errno::ENOENT)?;
        let _guard = node.lock().lock().map_err(|_| Errno::EIO)?;
        let buf = node.content().open().map_err(|err| {
            error!(ino, "failed to open file content enclave: {err}");
            Errno::EIO
        })?;
        let attr = node.attr();
        let fattr = make_attr(
            ino,
            FileType::RegularFile,
            attr.mode as u16,
            attr.uid,
            attr.gid,
            buf.len() as u64,
        );
        buf.destroy();
        Ok(fattr)
    }

    /// Open a file's content for a read: the in-flight hand-off.
    ///
    /// The per-file lock is held only for the enclave open and the
    /// construction of the result; it is released when this returns, so
    /// reads of other files (and the next read of this one, once the
    /// result is dropped) proceed freely.
    fn start_read(&self, node: &FileNode, ino: u64, offset: u64, size: u32) -> Result<ReadResult, Errno> {
        let _guard = node.lock().lock().map_err(|_| Errno::EIO)?;
        let buf = node.content().open().map_err(|err| {
            error!(ino, "failed to open file content enclave: {err}");
            Errno::EIO
        })?;
        Ok(ReadResult::new(buf, offset, size))
    }
}

impl Filesystem for GpgFs {
    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(Errno::ENOENT);
            return;
        };
        let Some(ino) = self.tree.lookup(parent.0, name) else {
            reply.error(Errno::ENOENT);
            return;
        };
        match self.attr_of(ino) {
            Ok(attr) => {
                debug!(parent = parent.0, name, ino, "fuse lookup");
                reply.entry(&TTL, &attr, Generation(0));
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match self.attr_of(ino.0) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, _mask: AccessFlags, reply: ReplyEmpty) {
        // The mount is read-only and the kernel enforces the session ACL;
        // only existence is checked here.
        if self.tree.is_dir(ino.0) || self.tree.file(ino.0).is_some() {
            reply.ok();
        } else {
            reply.error(Errno::ENOENT);
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        // No per-handle state: every read re-opens the enclave.  Plaintext
        // is immutable for the mount lifetime, so the kernel may cache it.
        if self.tree.file(ino.0).is_some() {
            reply.opened(FileHandle(0), FopenFlags::KEEP_CACHE);
        } else {
            reply.error(Errno::ENOENT);
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        if self.tree.is_dir(ino.0) {
            reply.opened(FileHandle(0), FopenFlags::empty());
        } else {
            reply.error(Errno::ENOENT);
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let Some(node) = self.tree.file(ino.0) else {
            reply.error(Errno::ENOENT);
            return;
        };
        let result = match self.start_read(node, ino.0, offset, size) {
            Ok(result) => result,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        reply.data(result.bytes());
        // `result` drops here: the buffer is zeroed and unmapped exactly
        // once, after the kernel has consumed the reply.
    }

    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _offset: u64,
        _data: &[u8],
        _write_flags: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        reply.error(Errno::ENOSYS);
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(Errno::ENOSYS);
    }

    fn flush(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _lock_owner: LockOwner,
        reply: ReplyEmpty,
    ) {
        // Nothing buffered on our side.
        reply.ok();
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        if !self.tree.is_dir(ino.0) {
            reply.error(Errno::ENOENT);
            return;
        }

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino.0, FileType::Directory, ".".to_string()),
            (ino.0, FileType::Directory, "..".to_string()),
        ];
        if let Some(children) = self.tree.children(ino.0) {
            for (name, child_ino, is_dir) in children {
                entries.push((
                    *child_ino,
                    if *is_dir {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    },
                    name.clone(),
                ));
            }
        }

        for (i, (child_ino, kind, name)) in entries.iter().enumerate() {
            if (i as u64) < offset {
                continue;
            }
            if reply.add(INodeNo(*child_ino), (i + 1) as u64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        // Virtual and read-only: zero blocks, name limit 255.
        reply.statfs(0, 0, 0, self.tree.file_count(), 0, 4096, 255, 0);
    }
}

#[cfg(test)]
mod tests {
    use gpgfs_core::Enclave;

    use super::*;
    use crate::attr::NodeAttr;
    use crate::tree::{ROOT_INO, TreeBuilder};

    fn filesystem_with(content: &[u8]) -> (GpgFs, u64) {
        let mut builder = TreeBuilder::new();
        let node = FileNode::new(Enclave::new(content.to_vec()).unwrap(), NodeAttr::default());
        let ino = builder.add_file(ROOT_INO, "f", node);
        (GpgFs::new(builder.finish()), ino)
    }

    fn read_slice(fs: &GpgFs, ino: u64, offset: u64, size: u32) -> Vec<u8> {
        let node = fs.tree().file(ino).unwrap();
        let result = fs.start_read(node, ino, offset, size).unwrap();
        result.bytes().to_vec()
    }

    #[test]
    fn read_returns_the_requested_slice() {
        let (fs, ino) = filesystem_with(b"hello world");
        assert_eq!(read_slice(&fs, ino, 0, 5), b"hello");
        assert_eq!(read_slice(&fs, ino, 6, 5), b"world");
    }

    #[test]
    fn read_clamps_to_eof() {
        let (fs, ino) = filesystem_with(b"hello");
        assert_eq!(read_slice(&fs, ino, 3, 100), b"lo");
    }

    #[test]
    fn read_at_eof_is_empty() {
        let (fs, ino) = filesystem_with(b"hello");
        assert_eq!(read_slice(&fs, ino, 5, 16), b"");
    }

    #[test]
    fn read_past_eof_is_empty() {
        let (fs, ino) = filesystem_with(b"hello");
        assert_eq!(read_slice(&fs, ino, 999, 16), b"");
    }

    #[test]
    fn empty_file_reads_empty() {
        let (fs, ino) = filesystem_with(b"");
        assert_eq!(read_slice(&fs, ino, 0, 4096), b"");
    }

    #[test]
    fn getattr_size_matches_plaintext() {
        let (fs, ino) = filesystem_with(b"hello");
        let attr = fs.attr_of(ino).unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o400);
    }

    #[test]
    fn getattr_unknown_inode_is_enoent() {
        let (fs, _) = filesystem_with(b"x");
        assert_eq!(fs.attr_of(999).unwrap_err(), Errno::ENOENT);
    }

    #[test]
    fn root_attr_is_a_directory() {
        let (fs, _) = filesystem_with(b"x");
        let attr = fs.attr_of(ROOT_INO).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
    }

    #[test]
    fn sequential_reads_on_one_file() {
        // Two full open → hand-off → drop cycles on the same node must
        // observe identical content.
        let (fs, ino) = filesystem_with(b"stable bytes");
        let first = read_slice(&fs, ino, 0, 64);
        let second = read_slice(&fs, ino, 0, 64);
        assert_eq!(first, second);
    }

    #[test]
    fn concurrent_reads_across_files() {
        let mut builder = TreeBuilder::new();
        let a = builder.add_file(
            ROOT_INO,
            "a",
            FileNode::new(Enclave::new(vec![1u8; 64]).unwrap(), NodeAttr::default()),
        );
        let b = builder.add_file(
            ROOT_INO,
            "b",
            FileNode::new(Enclave::new(vec![2u8; 64]).unwrap(), NodeAttr::default()),
        );
        let fs = std::sync::Arc::new(GpgFs::new(builder.finish()));

        let handles: Vec<_> = [(a, 1u8), (b, 2u8)]
            .into_iter()
            .map(|(ino, fill)| {
                let fs = std::sync::Arc::clone(&fs);
                std::thread::spawn(move || {
                    for _ in 0..32 {
                        let node = fs.tree().file(ino).unwrap();
                        let result = fs.start_read(node, ino, 0, 64).unwrap();
                        assert!(result.bytes().iter().all(|&x| x == fill));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn in_flight_result_outlives_the_lock() {
        // The buffer handed to the kernel stays valid after the per-file
        // mutex is released and even while a second read begins.
        let (fs, ino) = filesystem_with(b"persistent");
        let node = fs.tree().file(ino).unwrap();
        let first = fs.start_read(node, ino, 0, 10).unwrap();
        let second = fs.start_read(node, ino, 0, 10).unwrap();
        assert_eq!(first.bytes(), b"persistent");
        assert_eq!(second.bytes(), b"persistent");
        drop(first);
        assert_eq!(second.bytes(), b"persistent");
    }
}
