//! Sealed secret storage.
//!
//! An [`Enclave`] holds bytes encrypted at rest in RAM: AES-256-CBC with an
//! HMAC-SHA256 over `iv || ciphertext` (encrypt-then-MAC), keyed from a
//! process-ephemeral master key that itself lives in a [`LockedBuffer`].
//! The enclave exposes no plaintext; [`Enclave::open`] re-materialises an
//! independent locked buffer per call.

use std::sync::{Arc, OnceLock};

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::buffer::LockedBuffer;
use crate::error::MemoryError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const MAC_LEN: usize = 32;

/// The process-wide sealing master key, kept in locked memory.
struct SealKey(LockedBuffer);

// Written once during initialisation, read-only for the process lifetime.
unsafe impl Sync for SealKey {}

static SEAL_KEY: OnceLock<SealKey> = OnceLock::new();

fn seal_key() -> Result<&'static LockedBuffer, MemoryError> {
    if let Some(k) = SEAL_KEY.get() {
        return Ok(&k.0);
    }
    let mut buf = LockedBuffer::new(KEY_LEN)?;
    rand::thread_rng().fill_bytes(buf.bytes_mut());
    // A racing initialiser loses and its buffer is zeroed on drop.
    let _ = SEAL_KEY.set(SealKey(buf));
    Ok(&SEAL_KEY.get().expect("seal key initialised above").0)
}

/// Derive the encryption and MAC keys from the master via HKDF-SHA256.
fn derive_keys(master: &[u8]) -> (Zeroizing<[u8; KEY_LEN]>, Zeroizing<[u8; KEY_LEN]>) {
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut enc = Zeroizing::new([0u8; KEY_LEN]);
    let mut mac = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(b"gpgfs enclave encryption key", &mut *enc)
        .expect("HKDF expand should not fail for 32-byte output");
    hk.expand(b"gpgfs enclave mac key", &mut *mac)
        .expect("HKDF expand should not fail for 32-byte output");
    (enc, mac)
}

/// A handle to sealed bytes.
///
/// Cloning is cheap (the sealed blob is shared); every clone opens the same
/// plaintext.  Safe to share across threads.
#[derive(Clone)]
pub struct Enclave {
    /// `iv || ciphertext || mac`
    sealed: Arc<Vec<u8>>,
}

impl Enclave {
    /// Seal `plaintext`, wiping the caller's copy before returning.
    ///
    /// The only failure mode is the OS refusing the locked page backing the
    /// process sealing key on first use.
    pub fn new(mut plaintext: Vec<u8>) -> Result<Self, MemoryError> {
        let master = seal_key()?;
        let (enc_key, mac_key) = derive_keys(master.bytes());

        let iv: [u8; IV_LEN] = rand::random();
        let cipher = Aes256CbcEnc::new(enc_key.as_slice().into(), iv.as_slice().into());
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(&plaintext);
        plaintext.zeroize();

        let mut sealed = Vec::with_capacity(IV_LEN + ciphertext.len() + MAC_LEN);
        sealed.extend_from_slice(&iv);
        sealed.extend(ciphertext);
        let mut mac = HmacSha256::new_from_slice(mac_key.as_slice())
            .expect("HMAC key should be valid for any length");
        mac.update(&sealed);
        sealed.extend_from_slice(&mac.finalize().into_bytes());

        Ok(Self { sealed: Arc::new(sealed) })
    }

    /// Unseal into a fresh locked buffer.
    ///
    /// Each call yields an independent buffer; concurrent opens never share
    /// pages.  Fails if the OS refuses to map or lock pages, or if the
    /// sealed blob no longer verifies (memory corruption).
    pub fn open(&self) -> Result<LockedBuffer, MemoryError> {
        let master = seal_key()?;
        let (enc_key, mac_key) = derive_keys(master.bytes());

        let (body, tag) = self.sealed.split_at(self.sealed.len() - MAC_LEN);
        let mut mac = HmacSha256::new_from_slice(mac_key.as_slice())
            .expect("HMAC key should be valid for any length");
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| MemoryError::SealIntegrity)?;

        let (iv, ciphertext) = body.split_at(IV_LEN);
        let cipher = Aes256CbcDec::new(enc_key.as_slice().into(), iv.into());
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| MemoryError::SealIntegrity)?;

        let mut buf = LockedBuffer::new(plaintext.len())?;
        buf.bytes_mut().copy_from_slice(&plaintext);
        Ok(buf)
    }
}

impl std::fmt::Debug for Enclave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Enclave([sealed])")
    }
}
