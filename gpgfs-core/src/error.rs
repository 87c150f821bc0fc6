//! Error types for the protected memory subsystem.

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("anonymous memory map failed: {0}")]
    Map(#[source] std::io::Error),

    #[error("guard page protection failed: {0}")]
    Protect(#[source] std::io::Error),

    #[error("page lock failed: {0}")]
    Lock(#[source] std::io::Error),

    #[error("sealed bytes failed integrity check")]
    SealIntegrity,

    #[error("locked buffer does not contain valid UTF-8")]
    NotUtf8,
}
