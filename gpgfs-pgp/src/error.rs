//! Error types for key adaptation and the codec.

#[derive(Debug, thiserror::Error)]
pub enum PgpError {
    #[error("failed to parse ssh private key: {0}")]
    SshParse(#[source] ssh_key::Error),

    #[error("unsupported ssh key algorithm: {0}")]
    UnsupportedKeyType(String),

    #[error("passphrase-protected ssh keys are not supported")]
    EncryptedKey,

    #[error("failed to parse key: {0}")]
    KeyParse(#[source] pgp::errors::Error),

    #[error("failed to sign key identity: {0}")]
    Sign(#[source] pgp::errors::Error),

    #[error("failed to encrypt to keyring: {0}")]
    Keyring(#[source] pgp::errors::Error),

    #[error("crypto operation failed: {0}")]
    Crypto(#[source] pgp::errors::Error),

    #[error("decrypted message contains no literal data")]
    NoContent,

    #[error("failed to resolve hostname: {0}")]
    Hostname(#[source] std::io::Error),

    #[error(transparent)]
    Memory(#[from] gpgfs_core::MemoryError),
}
