//! Encrypted blob store with single-blob and chunked stream framing.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use canonical::{decode_component, to_canonical_bytes};
use keyring::{decrypt_bytes, encrypt_bytes, EncryptedBlob};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::StoreError;
use crate::fsync::FsyncPolicy;
use crate::paths::{record_file_name, record_rel_path};
use crate::provider::DerivedKeyProvider;

const MAGIC_BLOB: &[u8; 4] = b"BLB\x01";
const MAGIC_STREAM: &[u8; 4] = b"STR\x01";
const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct BlobHeader {
    schema_version: u64,
    key_id: String,
    nonce_b64: String,
    ciphertext_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamHeader {
    schema_version: u64,
    key_id: String,
    chunk_size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamChunk {
    nonce_b64: String,
    ciphertext_b64: String,
}

/// AAD binding a chunk to its record and position, preventing reordering.
fn chunk_aad(record_id: &str, chunk_index: u64) -> Result<Vec<u8>, StoreError> {
    Ok(to_canonical_bytes(&json!({
        "record_id": record_id,
        "chunk_index": chunk_index,
    }))?)
}

/// Encrypted media store. One file per record, either `BLB\x01` single-blob
/// or `STR\x01` chunked stream framing.
pub struct BlobStore {
    root: PathBuf,
    provider: DerivedKeyProvider,
    require_decrypt: bool,
    fsync: FsyncPolicy,
    locations: RwLock<HashMap<String, PathBuf>>,
}

impl BlobStore {
    pub fn new(
        root: impl AsRef<Path>,
        provider: DerivedKeyProvider,
        require_decrypt: bool,
        fsync: FsyncPolicy,
    ) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            provider,
            require_decrypt,
            fsync,
            locations: RwLock::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn find_path(&self, record_id: &str) -> Option<PathBuf> {
        if let Some(path) = self.locations.read().expect("store lock").get(record_id) {
            if path.exists() {
                return Some(path.clone());
            }
        }
        let blob_name = record_file_name(record_id, "blob");
        let stream_name = record_file_name(record_id, "stream");
        let found = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| {
                if !e.file_type().is_file() {
                    return false;
                }
                let name = e.file_name().to_string_lossy();
                name == blob_name || name == stream_name
            })
            .map(|e| e.path().to_path_buf());
        if let Some(path) = &found {
            self.locations
                .write()
                .expect("store lock")
                .insert(record_id.to_string(), path.clone());
        }
        found
    }

    /// Write a record as a single sealed blob. Replaces any stream form.
    pub fn put(&self, record_id: &str, data: &[u8]) -> Result<(), StoreError> {
        let (key_id, key) = self.provider.active()?;
        let sealed = encrypt_bytes(&key, data, None, None)?;
        let header = BlobHeader {
            schema_version: 1,
            key_id,
            nonce_b64: sealed.nonce_b64,
            ciphertext_b64: sealed.ciphertext_b64,
        };
        let path = match self.find_path(record_id) {
            Some(existing) if existing.extension().is_some_and(|e| e == "blob") => existing,
            Some(stream) => {
                fs::remove_file(&stream)?;
                self.root.join(record_rel_path(record_id, None, "blob"))
            }
            None => self.root.join(record_rel_path(record_id, None, "blob")),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("blob.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(MAGIC_BLOB)?;
            write_frame(&mut file, &serde_json::to_vec(&header)?)?;
            self.fsync.sync(&file, true)?;
        }
        fs::rename(&tmp, &path)?;
        self.locations
            .write()
            .expect("store lock")
            .insert(record_id.to_string(), path);
        Ok(())
    }

    pub fn put_new(&self, record_id: &str, data: &[u8]) -> Result<(), StoreError> {
        if self.find_path(record_id).is_some() {
            return Err(StoreError::Conflict(record_id.to_string()));
        }
        self.put(record_id, data)
    }

    /// Write a record as a chunked stream; each chunk carries its own nonce
    /// and an AAD binding `(record_id, chunk_index)`.
    pub fn put_stream(
        &self,
        record_id: &str,
        reader: &mut dyn Read,
        chunk_size: usize,
    ) -> Result<(), StoreError> {
        let chunk_size = if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size };
        let (key_id, key) = self.provider.active()?;
        let path = match self.find_path(record_id) {
            Some(existing) if existing.extension().is_some_and(|e| e == "stream") => existing,
            Some(blob) => {
                fs::remove_file(&blob)?;
                self.root.join(record_rel_path(record_id, None, "stream"))
            }
            None => self.root.join(record_rel_path(record_id, None, "stream")),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("stream.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(MAGIC_STREAM)?;
            let header = StreamHeader {
                schema_version: 1,
                key_id,
                chunk_size: chunk_size as u64,
            };
            write_frame(&mut file, &serde_json::to_vec(&header)?)?;

            let mut buf = vec![0u8; chunk_size];
            let mut chunk_index = 0u64;
            loop {
                let n = read_full(reader, &mut buf)?;
                if n == 0 {
                    break;
                }
                let aad = chunk_aad(record_id, chunk_index)?;
                let sealed = encrypt_bytes(&key, &buf[..n], Some(&aad), None)?;
                let chunk = StreamChunk {
                    nonce_b64: sealed.nonce_b64,
                    ciphertext_b64: sealed.ciphertext_b64,
                };
                write_frame(&mut file, &serde_json::to_vec(&chunk)?)?;
                self.fsync.sync(&file, false)?;
                chunk_index += 1;
            }
            self.fsync.sync(&file, true)?;
        }
        fs::rename(&tmp, &path)?;
        self.locations
            .write()
            .expect("store lock")
            .insert(record_id.to_string(), path);
        Ok(())
    }

    pub fn has(&self, record_id: &str) -> bool {
        self.find_path(record_id).is_some()
    }

    pub fn get(&self, record_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(path) = self.find_path(record_id) else {
            return Ok(None);
        };
        let mut file = File::open(&path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        match &magic {
            MAGIC_BLOB => self.read_single(record_id, &mut file),
            MAGIC_STREAM => self.read_stream(record_id, &mut file),
            _ => Err(StoreError::InvalidFormat(format!(
                "unknown blob magic in {}",
                path.display()
            ))),
        }
    }

    fn read_single(
        &self,
        record_id: &str,
        file: &mut File,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let header: BlobHeader = serde_json::from_slice(&read_frame(file)?)?;
        let blob = EncryptedBlob {
            nonce_b64: header.nonce_b64,
            ciphertext_b64: header.ciphertext_b64,
            key_id: Some(header.key_id),
        };
        for (_id, key) in self.provider.candidates(blob.key_id.as_deref()) {
            if let Ok(plain) = decrypt_bytes(&key, &blob, None) {
                return Ok(Some(plain));
            }
        }
        self.decrypt_failure(record_id)
    }

    fn read_stream(
        &self,
        record_id: &str,
        file: &mut File,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let header: StreamHeader = serde_json::from_slice(&read_frame(file)?)?;
        let mut frames = Vec::new();
        loop {
            match try_read_frame(file)? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        'candidates: for (_id, key) in self.provider.candidates(Some(&header.key_id)) {
            let mut payload = Vec::new();
            for (chunk_index, frame) in frames.iter().enumerate() {
                let chunk: StreamChunk = serde_json::from_slice(frame)?;
                let blob = EncryptedBlob {
                    nonce_b64: chunk.nonce_b64,
                    ciphertext_b64: chunk.ciphertext_b64,
                    key_id: None,
                };
                let aad = chunk_aad(record_id, chunk_index as u64)?;
                match decrypt_bytes(&key, &blob, Some(&aad)) {
                    Ok(plain) => payload.extend_from_slice(&plain),
                    Err(_) => continue 'candidates,
                }
            }
            return Ok(Some(payload));
        }
        self.decrypt_failure(record_id)
    }

    fn decrypt_failure(&self, record_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if self.require_decrypt {
            Err(StoreError::DecryptFailed(record_id.to_string()))
        } else {
            warn!(record_id, "blob undecryptable with all candidates");
            Ok(None)
        }
    }

    pub fn delete(&self, record_id: &str) -> Result<bool, StoreError> {
        let Some(path) = self.find_path(record_id) else {
            return Ok(false);
        };
        fs::remove_file(path)?;
        self.locations.write().expect("store lock").remove(record_id);
        Ok(true)
    }

    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            for ext in [".blob", ".stream"] {
                if let Some(stem) = name.strip_suffix(ext) {
                    ids.push(decode_component(stem));
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Re-encrypt every record under the active key, preserving framing.
    pub fn rewrap(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        for record_id in self.keys()? {
            let Some(path) = self.find_path(&record_id) else {
                continue;
            };
            let is_stream = path.extension().is_some_and(|e| e == "stream");
            let Some(data) = self.get(&record_id)? else {
                continue;
            };
            if is_stream {
                let mut cursor = std::io::Cursor::new(data);
                self.put_stream(&record_id, &mut cursor, DEFAULT_CHUNK_SIZE)?;
            } else {
                self.put(&record_id, &data)?;
            }
            count += 1;
        }
        Ok(count)
    }
}

fn write_frame(file: &mut File, payload: &[u8]) -> Result<(), StoreError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::InvalidFormat("frame too large".into()))?;
    file.write_all(&len.to_le_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

fn read_frame(file: &mut File) -> Result<Vec<u8>, StoreError> {
    try_read_frame(file)?.ok_or_else(|| StoreError::InvalidFormat("truncated frame".into()))
}

fn try_read_frame(file: &mut File) -> Result<Option<Vec<u8>>, StoreError> {
    let mut len_bytes = [0u8; 4];
    match file.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)?;
    Ok(Some(payload))
}

fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
