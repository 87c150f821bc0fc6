//! Protected memory primitives and shared configuration for gpgfs.
//!
//! Secrets (the OpenPGP key and every decrypted plaintext) live in one of
//! two states:
//!
//! - sealed inside an [`Enclave`] — encrypted at rest in RAM, freely
//!   shareable across threads;
//! - materialised in a [`LockedBuffer`] — an mlocked, guard-paged region
//!   that is canary-checked and zeroed when it is dropped.
//!
//! Nothing in this crate ever writes secret bytes to an ordinary heap
//! allocation that outlives the call holding it.

pub mod bootstrap;
pub mod buffer;
pub mod config;
pub mod enclave;
mod error;

pub use buffer::{LockedBuffer, wipe};
pub use enclave::Enclave;
pub use error::MemoryError;
