//! Message encryption and decryption around a key held in a locked buffer.
//!
//! Both operations parse the armored key on every call: the key exists as
//! plaintext only inside the caller's [`LockedBuffer`] and in the parsed
//! form rPGP zeroizes when it is dropped.

use std::io::Cursor;

use pgp::composed::{Deserializable, Message, SignedPublicKey, SignedSecretKey};
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::ser::Serialize;

use gpgfs_core::LockedBuffer;

use crate::error::PgpError;

/// Encrypt `plaintext` to the key in `key_buf`.
///
/// A private key is reduced to its public half first, so the same buffer
/// the mount decrypts with can also receive messages.
pub fn encrypt(key_buf: &LockedBuffer, plaintext: &[u8]) -> Result<Vec<u8>, PgpError> {
    let armored = key_buf.as_str()?;
    let public = match SignedSecretKey::from_string(armored) {
        Ok((secret, _)) => SignedPublicKey::from(secret),
        Err(_) => {
            SignedPublicKey::from_string(armored)
                .map_err(PgpError::KeyParse)?
                .0
        }
    };

    let message = Message::new_literal_bytes("", plaintext);
    let mut rng = rand::thread_rng();
    let encrypted = message
        .encrypt_to_keys(&mut rng, SymmetricKeyAlgorithm::AES256, &[&public])
        .map_err(PgpError::Keyring)?;
    encrypted.to_bytes().map_err(PgpError::Crypto)
}

/// Decrypt a binary OpenPGP message with the armored private key in
/// `key_buf`.
///
/// Returns plaintext bytes the caller is expected to wipe (or seal into an
/// enclave) when done.
pub fn decrypt(key_buf: &LockedBuffer, ciphertext: &[u8]) -> Result<Vec<u8>, PgpError> {
    let armored = key_buf.as_str()?;
    let (secret, _) = SignedSecretKey::from_string(armored).map_err(PgpError::KeyParse)?;

    let message = Message::from_bytes(Cursor::new(ciphertext)).map_err(PgpError::Crypto)?;
    let (mut decrypted, _key_ids) = message
        .decrypt(|| String::new(), &[&secret])
        .map_err(PgpError::Crypto)?;
    if let Message::Compressed(_) = decrypted {
        decrypted = decrypted.decompress().map_err(PgpError::Crypto)?;
    }
    decrypted
        .get_content()
        .map_err(PgpError::Crypto)?
        .ok_or(PgpError::NoContent)
    // `secret` drops here; its private parameters are zeroized by rPGP.
}

#[cfg(test)]
mod tests {
    use gpgfs_core::Enclave;
    use gpgfs_core::config::KeyFormat;

    use super::*;
    use crate::adapter::{KeyKind, convert_key, new_key_enclave};
    use crate::testkeys::RSA_KEY;
    use crate::uid::KeyUserId;

    fn test_uid() -> KeyUserId {
        KeyUserId::new("root", "gpgfs fuse key", "root@testhost")
    }

    fn key_buffer(kind: KeyKind) -> gpgfs_core::LockedBuffer {
        new_key_enclave(KeyFormat::Ssh, &test_uid(), kind, RSA_KEY.to_vec())
            .unwrap()
            .open()
            .unwrap()
    }

    #[test]
    fn rsa_roundtrip_with_public_half() {
        let private = key_buffer(KeyKind::Private);
        let public = key_buffer(KeyKind::Public);

        let ciphertext = encrypt(&public, b"hello").unwrap();
        assert_ne!(ciphertext.as_slice(), b"hello");
        let plaintext = decrypt(&private, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn encrypt_accepts_a_private_key() {
        let private = key_buffer(KeyKind::Private);
        let ciphertext = encrypt(&private, b"to self").unwrap();
        assert_eq!(decrypt(&private, &ciphertext).unwrap(), b"to self");
    }

    #[test]
    fn large_message_roundtrip() {
        let private = key_buffer(KeyKind::Private);
        let payload = vec![0x41u8; 1 << 20];
        let ciphertext = encrypt(&private, &payload).unwrap();
        assert_eq!(decrypt(&private, &ciphertext).unwrap(), payload);
    }

    #[test]
    fn empty_message_roundtrip() {
        let private = key_buffer(KeyKind::Private);
        let ciphertext = encrypt(&private, b"").unwrap();
        assert_eq!(decrypt(&private, &ciphertext).unwrap(), b"");
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let private = key_buffer(KeyKind::Private);
        let ciphertext = encrypt(&private, b"secret").unwrap();

        // A different entity derived from another key cannot read it.
        let other_pem = crate::testkeys::ED25519_KEY;
        let other = new_key_enclave(KeyFormat::Ssh, &test_uid(), KeyKind::Private, other_pem.to_vec())
            .unwrap()
            .open()
            .unwrap();
        assert!(decrypt(&other, &ciphertext).is_err());
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let private = key_buffer(KeyKind::Private);
        assert!(decrypt(&private, b"definitely not pgp").is_err());
    }

    #[test]
    fn key_buffer_must_hold_a_key() {
        let bogus = Enclave::new(b"-----BEGIN NONSENSE-----".to_vec())
            .unwrap()
            .open()
            .unwrap();
        let err = decrypt(&bogus, b"").unwrap_err();
        assert!(matches!(err, PgpError::KeyParse(_)));
    }

    #[test]
    fn converted_keys_are_interchangeable() {
        // Adapting the same SSH key twice yields the same recipient: a
        // message encrypted against one conversion decrypts with the other.
        let private = key_buffer(KeyKind::Private);
        let again = key_buffer(KeyKind::Private);
        let ct = encrypt(&private, b"x").unwrap();
        assert_eq!(decrypt(&again, &ct).unwrap(), b"x");
    }
}
