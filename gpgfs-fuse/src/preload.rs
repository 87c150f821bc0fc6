//! The one-shot preload walk.
//!
//! Walks the source tree depth-first (ascending filename order within a
//! directory), decrypts every `*.gpg` regular file with the mount key, and
//! attaches the plaintexts — each sealed in its own enclave — into the
//! inode tree at the suffix-stripped virtual path.
//!
//! Per-entry problems are logged and skipped so a foreign or corrupt blob
//! in a shared tree cannot deny service.  Attr overlay problems abort the
//! mount; see [`crate::attr`].

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use gpgfs_core::{Enclave, LockedBuffer, wipe};
use gpgfs_pgp::codec;

use crate::attr;
use crate::error::PreloadError;
use crate::tree::{FileNode, ROOT_INO, Tree, TreeBuilder};

pub const ENCRYPTED_SUFFIX: &str = "gpg";
pub const ATTR_SUFFIX: &str = "yml";

/// Decrypt every candidate under `source` and build the inode tree.
///
/// The key enclave is opened once and the buffer held for the whole walk;
/// it is destroyed before this returns.  The returned tree is frozen.
pub fn preload(key: &Enclave, source: &Path) -> Result<Tree, PreloadError> {
    let key_buf = key.open().map_err(PreloadError::KeyUnseal)?;
    let mut builder = TreeBuilder::new();
    let result = walk(&key_buf, source, source, &mut builder);
    key_buf.destroy();
    result?;
    Ok(builder.finish())
}

fn walk(
    key_buf: &LockedBuffer,
    source: &Path,
    dir: &Path,
    builder: &mut TreeBuilder,
) -> Result<(), PreloadError> {
    let reader = match fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(err) => {
            warn!(path = %dir.display(), "skipping directory because of error: {err}");
            return Ok(());
        }
    };

    let mut entries: Vec<_> = reader
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(path = %dir.display(), "skipping entry because of error: {err}");
                None
            }
        })
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        // file_type does not follow symlinks, so a symlinked directory or
        // file lands in the non-regular arm below.
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                warn!(path = %path.display(), "skipping entry because of error: {err}");
                continue;
            }
        };

        if file_type.is_dir() {
            walk(key_buf, source, &path, builder)?;
            continue;
        }
        if !file_type.is_file() {
            warn!(path = %path.display(), "skipping unsupported file type");
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(ENCRYPTED_SUFFIX) {
            warn!(
                path = %path.display(),
                "skipping file without required suffix \".{ENCRYPTED_SUFFIX}\""
            );
            continue;
        }

        mount_file(key_buf, source, &path, builder)?;
    }
    Ok(())
}

fn mount_file(
    key_buf: &LockedBuffer,
    source: &Path,
    path: &Path,
    builder: &mut TreeBuilder,
) -> Result<(), PreloadError> {
    let ciphertext = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = %path.display(), "skipping file because of error: {err}");
            return Ok(());
        }
    };

    let mut plaintext = match codec::decrypt(key_buf, &ciphertext) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(path = %path.display(), "skipping undecryptable file: {err}");
            return Ok(());
        }
    };

    let virtual_path = path.with_extension("");
    let rel = match virtual_path.strip_prefix(source) {
        Ok(rel) => rel.to_path_buf(),
        Err(err) => {
            wipe(&mut plaintext);
            warn!(path = %path.display(), "skipping file outside the source root: {err}");
            return Ok(());
        }
    };
    let Some(base) = rel.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        wipe(&mut plaintext);
        warn!(path = %path.display(), "skipping file with an empty virtual name");
        return Ok(());
    };

    let mut parent = ROOT_INO;
    if let Some(dir_part) = rel.parent() {
        for component in dir_part.components() {
            let name = component.as_os_str().to_string_lossy();
            let (ino, created) = builder.ensure_dir(parent, &name);
            if created {
                info!(
                    inode = ino,
                    path = %path.display(),
                    component = %name,
                    "mounting directory component"
                );
            }
            parent = ino;
        }
    }

    let attr_path = path.with_extension(ATTR_SUFFIX);
    let attr = match attr::load(&attr_path) {
        Ok(attr) => attr,
        Err(err) => {
            wipe(&mut plaintext);
            return Err(err);
        }
    };

    let enclave = Enclave::new(plaintext)
        .map_err(|source| PreloadError::Seal { path: path.to_path_buf(), source })?;
    let ino = builder.add_file(parent, &base, FileNode::new(enclave, attr));
    info!(
        inode = ino,
        path = %path.display(),
        virtual_path = %rel.display(),
        "mounting file"
    );
    Ok(())
}
