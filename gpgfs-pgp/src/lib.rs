//! SSH → OpenPGP key adaptation and the message codec.
//!
//! The mount key is an SSH private key (RSA or Ed25519).  [`adapter`]
//! turns it into a self-signed OpenPGP entity with deterministic, epoch-0
//! timestamps; [`codec`] wraps the parse → keyring → encrypt/decrypt
//! plumbing around a key held in a locked buffer.

pub mod adapter;
pub mod codec;
mod error;
#[cfg(test)]
pub(crate) mod testkeys;
mod uid;

pub use adapter::{KeyKind, convert_key, new_key_enclave};
pub use error::PgpError;
pub use uid::KeyUserId;
