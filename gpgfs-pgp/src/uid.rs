//! The user identity attached to adapted keys.

use crate::error::PgpError;

/// An OpenPGP user id, threaded explicitly through the adapter rather than
/// hiding behind process-global state.
///
/// Renders as `<name> (<comment>) <email>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUserId {
    pub name: String,
    pub comment: String,
    pub email: String,
}

impl KeyUserId {
    pub fn new(
        name: impl Into<String>,
        comment: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            comment: comment.into(),
            email: email.into(),
        }
    }

    /// The default mount identity: `root (gpgfs fuse key) root@<hostname>`.
    ///
    /// Resolved once at startup; an unresolvable hostname is fatal there.
    pub fn default_for_host() -> Result<Self, PgpError> {
        let host = hostname()?;
        Ok(Self::new("root", "gpgfs fuse key", format!("root@{host}")))
    }
}

impl std::fmt::Display for KeyUserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}) <{}>", self.name, self.comment, self.email)
    }
}

fn hostname() -> Result<String, PgpError> {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes into a fixed-size buffer we own.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(PgpError::Hostname(std::io::Error::last_os_error()));
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}
