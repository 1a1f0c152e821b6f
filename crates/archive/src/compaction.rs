//! Derived-only storage compaction.

use std::path::Path;

use canonical::now_ts_utc;
use evidence::ImmutableMetadataStore;
use ledger::EventBuilder;
use serde_json::{json, Value};
use storage::BlobStore;
use tracing::{info, warn};

use crate::error::ArchiveError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    pub derived_metadata: u64,
    pub derived_media: u64,
    pub removed_index_files: u64,
    pub freed_bytes: u64,
    pub dry_run: bool,
}

fn is_derived_id(record_id: &str) -> bool {
    let token = record_id.to_lowercase();
    token.starts_with("derived.") || token.contains("/derived.") || token.contains("/derived/")
}

fn is_derived(record_id: &str, record: &Value) -> bool {
    record
        .get("record_type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.starts_with("derived."))
        || is_derived_id(record_id)
}

fn path_size(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }
    if path.is_file() {
        return path.metadata().map(|m| m.len()).unwrap_or(0);
    }
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Delete all derived metadata and media plus the lexical/vector index
/// files. Evidence, the ledger, and the journal are never touched.
pub fn compact_derived(
    metadata: &ImmutableMetadataStore,
    media: &BlobStore,
    data_dir: &Path,
    dry_run: bool,
    events: Option<&EventBuilder>,
) -> Result<CompactionResult, ArchiveError> {
    let metadata_path = data_dir.join("metadata");
    let lexical_path = data_dir.join("lexical.db");
    let vector_path = data_dir.join("vector.db");
    let before = path_size(&metadata_path)
        + path_size(media.root())
        + path_size(&lexical_path)
        + path_size(&vector_path);

    let mut derived_meta: Vec<String> = Vec::new();
    for record_id in metadata.keys()? {
        if let Some(record) = metadata.get(&record_id)? {
            if is_derived(&record_id, &record) {
                derived_meta.push(record_id);
            }
        }
    }
    let derived_media: Vec<String> = media
        .keys()?
        .into_iter()
        .filter(|id| is_derived_id(id))
        .collect();

    let mut removed_index_files = 0u64;
    if dry_run {
        removed_index_files =
            u64::from(lexical_path.exists()) + u64::from(vector_path.exists());
    } else {
        for record_id in &derived_meta {
            if let Err(err) = metadata.delete(record_id) {
                warn!(record_id, %err, "compaction skipped metadata record");
            }
        }
        for record_id in &derived_media {
            if let Err(err) = media.delete(record_id) {
                warn!(record_id, %err, "compaction skipped media record");
            }
        }
        for path in [&lexical_path, &vector_path] {
            if path.exists() {
                std::fs::remove_file(path)?;
                removed_index_files += 1;
            }
        }
    }

    let after = if dry_run {
        before
    } else {
        path_size(&metadata_path)
            + path_size(media.root())
            + path_size(&lexical_path)
            + path_size(&vector_path)
    };
    let result = CompactionResult {
        derived_metadata: derived_meta.len() as u64,
        derived_media: derived_media.len() as u64,
        removed_index_files,
        freed_bytes: before.saturating_sub(after),
        dry_run,
    };
    info!(
        derived_metadata = result.derived_metadata,
        derived_media = result.derived_media,
        freed_bytes = result.freed_bytes,
        dry_run,
        "compaction finished"
    );

    if let Some(events) = events {
        let ts = now_ts_utc();
        let payload = json!({
            "event": "storage.compact_derived",
            "schema_version": 1,
            "derived_metadata": result.derived_metadata,
            "derived_media": result.derived_media,
            "removed_index_files": result.removed_index_files,
            "freed_bytes": result.freed_bytes,
            "dry_run": result.dry_run,
            "ts_utc": ts,
        });
        events.journal_event("storage.compact_derived", &payload, None, Some(&ts))?;
        events.ledger_entry("storage.compact_derived", &[], &[], Some(&payload), None, Some(&ts))?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyring::{Keyring, LoadOptions, Purpose};
    use std::sync::Arc;
    use storage::{DerivedKeyProvider, EncryptedJsonStore, FsyncPolicy};
    use tempfile::TempDir;

    fn fixture() -> (TempDir, ImmutableMetadataStore, BlobStore) {
        let dir = TempDir::new().unwrap();
        let ring = Arc::new(
            Keyring::load(dir.path().join("vault/keyring.json"), LoadOptions::default()).unwrap(),
        );
        let metadata = ImmutableMetadataStore::new(Arc::new(
            EncryptedJsonStore::new(
                dir.path().join("metadata"),
                DerivedKeyProvider::new(ring.clone(), Purpose::Metadata),
                true,
                FsyncPolicy::None,
            )
            .unwrap(),
        ));
        let media = BlobStore::new(
            dir.path().join("media"),
            DerivedKeyProvider::new(ring, Purpose::Media),
            true,
            FsyncPolicy::None,
        )
        .unwrap();
        (dir, metadata, media)
    }

    fn seed(metadata: &ImmutableMetadataStore, media: &BlobStore) {
        let evidence = json!({
            "record_type": "evidence.capture.frame",
            "schema_version": 1,
            "run_id": "run1",
            "ts_utc": "2026-01-02T00:00:00Z",
            "content_hash": "x",
        });
        metadata.put_new("run1/capture.frame/1", &evidence).unwrap();
        media.put_new("run1/capture.frame/1", b"frame").unwrap();
        let derived = json!({
            "record_type": "derived.sst.state",
            "schema_version": 1,
            "run_id": "run1",
            "ts_utc": "2026-01-02T00:00:01Z",
            "source_id": "run1/capture.frame/1",
            "content_hash": "y",
        });
        metadata.put_new("run1/derived.sst.state/a", &derived).unwrap();
        media.put_new("run1/derived.sst.render/a", b"derived-bytes").unwrap();
    }

    #[test]
    fn dry_run_counts_without_deleting() {
        let (dir, metadata, media) = fixture();
        seed(&metadata, &media);
        let result = compact_derived(&metadata, &media, dir.path(), true, None).unwrap();
        assert!(result.dry_run);
        assert_eq!(result.derived_metadata, 1);
        assert_eq!(result.derived_media, 1);
        assert_eq!(result.freed_bytes, 0);
        assert!(metadata.get("run1/derived.sst.state/a").unwrap().is_some());
        assert!(media.has("run1/derived.sst.render/a"));
    }

    #[test]
    fn compaction_removes_only_derived() {
        let (dir, metadata, media) = fixture();
        seed(&metadata, &media);
        std::fs::write(dir.path().join("lexical.db"), b"index").unwrap();
        let result = compact_derived(&metadata, &media, dir.path(), false, None).unwrap();
        assert_eq!(result.derived_metadata, 1);
        assert_eq!(result.derived_media, 1);
        assert_eq!(result.removed_index_files, 1);
        assert!(result.freed_bytes > 0);

        assert!(metadata.get("run1/capture.frame/1").unwrap().is_some());
        assert!(media.has("run1/capture.frame/1"));
        assert!(metadata.get("run1/derived.sst.state/a").unwrap().is_none());
        assert!(!media.has("run1/derived.sst.render/a"));
        assert!(!dir.path().join("lexical.db").exists());
    }
}
