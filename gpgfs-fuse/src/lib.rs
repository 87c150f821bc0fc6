//! FUSE filesystem over an OpenPGP-encrypted source tree.
//!
//! ```text
//! source/                 target/ (read-only mount)
//! ├── a.gpg               ├── a          decrypted plaintext, mode 0400
//! ├── a.yml               │
//! └── b/c.gpg             └── b/c
//! ```
//!
//! [`preload::preload`] walks the source, decrypts every candidate with
//! the key enclave, and freezes the inode tree; [`mount`] then publishes
//! it to the kernel.  No FUSE request can observe a partially built tree.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use fuser::{BackgroundSession, Config, MountOption, SessionACL};

pub mod attr;
mod error;
pub mod fs;
pub mod preload;
#[cfg(test)]
pub(crate) mod testkeys;
pub mod tree;

pub use error::PreloadError;
pub use fs::GpgFs;
pub use preload::preload;
pub use tree::Tree;

/// A handle to a mounted filesystem.
///
/// Dropping it unmounts: the `BackgroundSession` drop performs the kernel
/// unmount, with a `fusermount3 -u` fallback in case the mount outlives
/// the session (e.g. on panic).  The tree — and every enclave in it —
/// drops with the handle.
pub struct MountHandle {
    session: Option<BackgroundSession>,
    target: PathBuf,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        drop(self.session.take());
        let _ = std::process::Command::new("fusermount3")
            .args(["-u", self.target.to_string_lossy().as_ref()])
            .output();
    }
}

/// Publish a preloaded filesystem at `target`, read-only.
///
/// With `allow_other` the kernel admits other users (requires
/// `user_allow_other` in `/etc/fuse.conf`); otherwise access is
/// restricted to the mounting uid.
pub fn mount(filesystem: GpgFs, target: &Path, allow_other: bool) -> anyhow::Result<MountHandle> {
    let mut config = Config::default();
    config.mount_options = vec![MountOption::RO, MountOption::FSName("gpgfs".to_string())];
    if allow_other {
        config.mount_options.push(MountOption::AllowOther);
        config.acl = SessionACL::All;
    } else {
        config.acl = SessionACL::Owner;
    }

    let session = fuser::spawn_mount2(filesystem, target, &config)
        .with_context(|| format!("mount FUSE at {target:?}"))?;

    Ok(MountHandle { session: Some(session), target: target.to_path_buf() })
}
