//! Daemon configuration.
//!
//! Loaded from TOML by `gpgfsd`; command-line flags override individual
//! fields.  Everything defaults so a missing file is not an error — the
//! daemon validates required fields after merging.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub key: KeyConfig,
    #[serde(default)]
    pub mount: MountConfig,
}

/// On-disk formats the key loader understands.
///
/// Only `ssh` today; new formats are a local addition here and in the
/// adapter dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    Ssh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default = "default_key_format")]
    pub format: KeyFormat,
    /// Path to the PEM-encoded private key.  Required for mounting.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self { format: default_key_format(), path: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountConfig {
    /// Directory holding the `*.gpg` tree.
    #[serde(default)]
    pub source: Option<PathBuf>,
    /// Mount point.
    #[serde(default)]
    pub target: Option<PathBuf>,
    /// Allow access by users other than the mounting one.
    #[serde(default)]
    pub allow_other: bool,
}

fn default_key_format() -> KeyFormat {
    KeyFormat::Ssh
}
