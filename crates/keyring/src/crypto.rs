//! AES-256-GCM blob primitives and HKDF key derivation.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::CryptoError;

/// Fixed HKDF salt binding derived keys to this application.
pub const HKDF_SALT: &[u8] = b"autocapture_nx";

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// An AEAD-sealed payload as it appears inside store files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub nonce_b64: String,
    pub ciphertext_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

/// Derive a 32-byte purpose key from a root key via HKDF-SHA256.
pub fn derive_key(root: &[u8], info: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), root);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;
    Ok(okm)
}

/// Seal plaintext under a 32-byte key with a fresh random 12-byte nonce.
pub fn encrypt_bytes(
    key: &[u8],
    plaintext: &[u8],
    aad: Option<&[u8]>,
    key_id: Option<&str>,
) -> Result<EncryptedBlob, CryptoError> {
    let cipher = cipher_for(key)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let payload = Payload {
        msg: plaintext,
        aad: aad.unwrap_or(&[]),
    };
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| CryptoError::EncryptFailed)?;
    Ok(EncryptedBlob {
        nonce_b64: STANDARD.encode(nonce),
        ciphertext_b64: STANDARD.encode(ciphertext),
        key_id: key_id.map(str::to_string),
    })
}

/// Open a sealed blob. Fails on wrong key, wrong AAD, or any tamper.
pub fn decrypt_bytes(
    key: &[u8],
    blob: &EncryptedBlob,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for(key)?;
    let nonce = STANDARD
        .decode(&blob.nonce_b64)
        .map_err(|_| CryptoError::DecryptFailed)?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::DecryptFailed);
    }
    let ciphertext = STANDARD
        .decode(&blob.ciphertext_b64)
        .map_err(|_| CryptoError::DecryptFailed)?;
    let payload = Payload {
        msg: &ciphertext,
        aad: aad.unwrap_or(&[]),
    };
    cipher
        .decrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| CryptoError::DecryptFailed)
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: key.len(),
        });
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)))
}

/// 32 random bytes from the OS RNG.
pub(crate) fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = random_key();
        let blob = encrypt_bytes(&key, b"secret", None, Some("k1")).unwrap();
        assert_eq!(blob.key_id.as_deref(), Some("k1"));
        let open = decrypt_bytes(&key, &blob, None).unwrap();
        assert_eq!(open, b"secret");
    }

    #[test]
    fn aad_binds_context() {
        let key = random_key();
        let blob = encrypt_bytes(&key, b"secret", Some(b"ctx"), None).unwrap();
        assert!(decrypt_bytes(&key, &blob, Some(b"ctx")).is_ok());
        assert!(decrypt_bytes(&key, &blob, Some(b"other")).is_err());
        assert!(decrypt_bytes(&key, &blob, None).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let blob = encrypt_bytes(&random_key(), b"secret", None, None).unwrap();
        assert!(decrypt_bytes(&random_key(), &blob, None).is_err());
    }

    #[test]
    fn derive_key_is_deterministic_per_info() {
        let root = random_key();
        let a = derive_key(&root, "metadata").unwrap();
        let b = derive_key(&root, "metadata").unwrap();
        let c = derive_key(&root, "media").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn nonces_never_repeat() {
        let key = random_key();
        let a = encrypt_bytes(&key, b"x", None, None).unwrap();
        let b = encrypt_bytes(&key, b"x", None, None).unwrap();
        assert_ne!(a.nonce_b64, b.nonce_b64);
    }
}
