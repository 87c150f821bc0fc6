//! Fatal preload errors.
//!
//! Only conditions that abort the whole mount live here.  Per-entry
//! problems (unreadable ciphertext, foreign files, undecryptable blobs)
//! are logged and skipped inside the walk instead.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PreloadError {
    #[error("failed to open key enclave: {0}")]
    KeyUnseal(#[source] gpgfs_core::MemoryError),

    #[error("failed to seal plaintext of {path}: {source}")]
    Seal {
        path: PathBuf,
        #[source]
        source: gpgfs_core::MemoryError,
    },

    #[error("failed to read attr overlay {path}: {source}")]
    OverlayRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse attr overlay {path}: {source}")]
    OverlayParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("user lookup failed for attr overlay {path}: {source}")]
    UserLookup {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("unknown user {user:?} in attr overlay {path}")]
    UnknownUser { path: PathBuf, user: String },

    #[error("group lookup failed for attr overlay {path}: {source}")]
    GroupLookup {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("unknown group {group:?} in attr overlay {path}")]
    UnknownGroup { path: PathBuf, group: String },
}
