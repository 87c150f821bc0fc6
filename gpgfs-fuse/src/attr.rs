//! Per-file attribute overlays.
//!
//! A sibling `<name>.yml` next to `<name>.gpg` overrides the mode and the
//! ownership of the exposed plaintext file:
//!
//! ```yaml
//! mode: 0o440
//! user: backup
//! group: backup
//! ```
//!
//! Unknown keys are tolerated; missing fields keep their defaults (mode
//! `0o400`, uid/gid of the mounting process).  Any failure other than the
//! overlay being absent aborts the mount — a broken overlay means the
//! operator's intent cannot be honoured.

use std::io;
use std::path::Path;

use nix::unistd::{Group, User};
use serde::Deserialize;
use tracing::debug;

use crate::error::PreloadError;

pub const DEFAULT_FILE_MODE: u32 = 0o400;

/// Raw overlay schema as it appears on disk.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Overlay {
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

/// Fully resolved attributes for one file node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Default for NodeAttr {
    fn default() -> Self {
        Self {
            mode: DEFAULT_FILE_MODE,
            // SAFETY: getuid/getgid always succeed.
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

/// Load and resolve the overlay at `path`.
///
/// A missing overlay yields [`NodeAttr::default`].
pub fn load(path: &Path) -> Result<NodeAttr, PreloadError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(NodeAttr::default()),
        Err(source) => {
            return Err(PreloadError::OverlayRead { path: path.to_path_buf(), source });
        }
    };
    let overlay: Overlay = serde_yaml::from_str(&raw)
        .map_err(|source| PreloadError::OverlayParse { path: path.to_path_buf(), source })?;
    let attr = resolve(path, overlay)?;
    debug!(path = %path.display(), ?attr, "loaded attr overlay");
    Ok(attr)
}

fn resolve(path: &Path, overlay: Overlay) -> Result<NodeAttr, PreloadError> {
    let mut attr = NodeAttr::default();
    if let Some(mode) = overlay.mode {
        attr.mode = mode;
    }
    if let Some(name) = &overlay.user {
        let user = User::from_name(name)
            .map_err(|source| PreloadError::UserLookup { path: path.to_path_buf(), source })?
            .ok_or_else(|| PreloadError::UnknownUser {
                path: path.to_path_buf(),
                user: name.clone(),
            })?;
        attr.uid = user.uid.as_raw();
    }
    if let Some(name) = &overlay.group {
        let group = Group::from_name(name)
            .map_err(|source| PreloadError::GroupLookup { path: path.to_path_buf(), source })?
            .ok_or_else(|| PreloadError::UnknownGroup {
                path: path.to_path_buf(),
                group: name.clone(),
            })?;
        attr.gid = group.gid.as_raw();
    }
    Ok(attr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_overlay(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("secret.yml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_overlay_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let attr = load(&dir.path().join("absent.yml")).unwrap();
        assert_eq!(attr, NodeAttr::default());
        assert_eq!(attr.mode, 0o400);
    }

    #[test]
    fn mode_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_overlay(&dir, "mode: 0o444\n");
        let attr = load(&path).unwrap();
        assert_eq!(attr.mode, 0o444);
        assert_eq!(attr.uid, NodeAttr::default().uid);
    }

    #[test]
    fn user_and_group_resolve_to_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_overlay(&dir, "mode: 0o444\nuser: root\ngroup: root\n");
        let attr = load(&path).unwrap();
        assert_eq!(attr.uid, 0);
        assert_eq!(attr.gid, 0);
    }

    #[test]
    fn unknown_user_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_overlay(&dir, "user: no_such_account_gpgfs\n");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, PreloadError::UnknownUser { .. }));
    }

    #[test]
    fn unknown_group_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_overlay(&dir, "group: no_such_group_gpgfs\n");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, PreloadError::UnknownGroup { .. }));
    }

    #[test]
    fn malformed_yaml_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_overlay(&dir, "mode: [not, a, number\n");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, PreloadError::OverlayParse { .. }));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_overlay(&dir, "mode: 0o400\ncomment: rotated 2024-01-01\n");
        let attr = load(&path).unwrap();
        assert_eq!(attr.mode, 0o400);
    }
}
