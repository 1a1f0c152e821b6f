//! # Encrypted Stores
//!
//! At-rest storage for the provenance kernel. Every payload is sealed with
//! AES-256-GCM under an HKDF-derived purpose key; decryption walks the
//! keyring's candidate list so reads keep working across rotations.
//!
//! Three stores share the same partitioned path layout
//! (`{root}/{enc(run)}/{bucket}/{YYYY}/{MM}/{DD}/{enc(record_id)}.{ext}`):
//!
//! - [`EncryptedJsonStore`] - metadata records as encrypted JSON files
//! - [`BlobStore`] - raw artifacts, single-blob (`BLB\x01`) or chunked
//!   stream (`STR\x01`) framing with per-chunk AAD
//! - [`EntityTokenStore`] - the small persisted token map

mod blob_store;
mod entity_map;
mod error;
mod fsync;
mod json_store;
mod paths;
mod provider;

pub use blob_store::BlobStore;
pub use entity_map::{EntityTokenRecord, EntityTokenStore};
pub use error::StoreError;
pub use fsync::FsyncPolicy;
pub use json_store::{EncryptedJsonStore, MemoryStore, RawStore};
pub use paths::{bucket_for_record_id, record_file_name, record_rel_path};
pub use provider::DerivedKeyProvider;
