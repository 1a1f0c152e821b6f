//! # Keyring
//!
//! Multi-purpose key management for the provenance kernel. A keyring owns
//! four purpose key sets (`metadata`, `media`, `entity_tokens`, `anchor`),
//! each an ordered list of 256-bit key records with one active key.
//!
//! Rotation appends a fresh key and activates it; existing ciphertexts stay
//! readable because stores decrypt against the ordered candidate list.
//! Portable bundles wrap the full purpose map with AES-GCM under a
//! passphrase-derived scrypt key for cross-machine migration.

mod bundle;
mod crypto;
mod error;
mod ring;

pub use bundle::{export_keyring_bundle, export_keys, import_keyring_bundle, import_keys};
pub use crypto::{decrypt_bytes, derive_key, encrypt_bytes, EncryptedBlob, HKDF_SALT};
pub use error::CryptoError;
pub use ring::{KeyRecord, Keyring, KeyringStatus, LoadOptions, Protector, Purpose, PURPOSES};
