//! Portable backup bundle create/restore with integrity checks.
//!
//! Distinct from proof bundles: backup bundles are raw-first operator
//! recovery artifacts. Restore never deletes; conflicting destinations are
//! archived to `<name>.bak.<UTC-timestamp>` before the new content lands.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use canonical::sha256_bytes_hex;
use chrono::Utc;
use keyring::{export_keyring_bundle, import_keyring_bundle, Keyring, LoadOptions};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::ArchiveError;

const KEYRING_BUNDLE_ZIP_PATH: &str = "data/vault/keyring.bundle.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupEntry {
    pub kind: String,
    pub relpath: String,
    pub zip_path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupManifest {
    schema_version: u64,
    created_utc: String,
    entries: Vec<BackupEntry>,
    includes_data: bool,
    includes_keyring_bundle: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub include_data: bool,
    pub include_keyring_bundle: bool,
    pub keyring_bundle_passphrase: Option<String>,
    pub overwrite: bool,
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub path: PathBuf,
    pub entries: usize,
    pub includes_data: bool,
    pub includes_keyring_bundle: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub extracted: usize,
    pub archived: Vec<PathBuf>,
}

fn categorize(path: &Path, repo: &Path, config_dir: &Path, data_dir: &Path) -> Option<(String, String)> {
    for (kind, root) in [("repo", repo), ("config", config_dir), ("data", data_dir)] {
        if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            return Some((kind.to_string(), rel));
        }
    }
    None
}

fn iter_files(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

/// Create a deterministic backup ZIP with `repo/`, `config/`, and `data/`
/// categories; the keyring rides along as an encrypted passphrase bundle.
pub fn create_backup_bundle(
    output_path: &Path,
    repo: &Path,
    config_dir: &Path,
    data_dir: &Path,
    keyring_path: &Path,
    options: &BackupOptions,
) -> Result<BackupReport, ArchiveError> {
    if output_path.exists() && !options.overwrite {
        return Err(ArchiveError::OutputExists(output_path.display().to_string()));
    }
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let config_user = config_dir.join("user.json");
    let lockfile = repo.join("config/plugin_locks.json");
    for required in [&config_user, &lockfile] {
        if !required.exists() {
            return Err(ArchiveError::MissingRequiredPath(required.display().to_string()));
        }
    }

    let mut files: Vec<PathBuf> = vec![config_user, lockfile];
    for optional in [
        data_dir.join("anchors.ndjson"),
        data_dir.join("data_anchor/anchors.ndjson"),
        data_dir.join("ledger.ndjson"),
        data_dir.join("journal.ndjson"),
    ] {
        if optional.is_file() {
            files.push(optional);
        }
    }
    if options.include_data {
        files.extend(iter_files(data_dir));
    } else {
        // Minimal set: metadata records plus index databases when present.
        let metadata_dir = data_dir.join("metadata");
        if metadata_dir.is_dir() {
            files.extend(iter_files(&metadata_dir));
        }
        for candidate in [data_dir.join("lexical.db"), data_dir.join("vector.db")] {
            if candidate.is_file() {
                files.push(candidate);
            }
        }
    }
    let mut uniq: BTreeMap<String, PathBuf> = BTreeMap::new();
    for path in files {
        uniq.insert(path.display().to_string(), path);
    }

    let keyring_bundle_bytes = if options.include_keyring_bundle {
        let passphrase = options
            .keyring_bundle_passphrase
            .as_deref()
            .ok_or(ArchiveError::MissingPassphrase)?;
        let ring = Keyring::load(keyring_path, LoadOptions::default())?;
        let tmp = tempfile_path(output_path, "keyring.bundle.json");
        export_keyring_bundle(&ring, &tmp, passphrase)?;
        let bytes = fs::read(&tmp)?;
        let _ = fs::remove_file(&tmp);
        Some(bytes)
    } else {
        None
    };

    let mut entries: Vec<BackupEntry> = Vec::new();
    let zip_options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());
    let mut writer = ZipWriter::new(File::create(output_path)?);

    // Collect entries first so zip paths enumerate in lexicographic order.
    let mut payloads: BTreeMap<String, (BackupEntry, Vec<u8>)> = BTreeMap::new();
    for path in uniq.values() {
        let Some((kind, rel)) = categorize(path, repo, config_dir, data_dir) else {
            // External paths would break portability; leave them out.
            warn!(path = %path.display(), "skipping path outside backup roots");
            continue;
        };
        let zip_path = format!("{kind}/{rel}");
        // The keyring file itself never travels unencrypted.
        if zip_path == "data/vault/keyring.json" {
            continue;
        }
        let data = fs::read(path)?;
        let entry = BackupEntry {
            kind,
            relpath: rel,
            zip_path: zip_path.clone(),
            sha256: sha256_bytes_hex(&data),
            size_bytes: data.len() as u64,
        };
        payloads.insert(zip_path, (entry, data));
    }
    if let Some(bytes) = &keyring_bundle_bytes {
        let entry = BackupEntry {
            kind: "data".to_string(),
            relpath: "vault/keyring.bundle.json".to_string(),
            zip_path: KEYRING_BUNDLE_ZIP_PATH.to_string(),
            sha256: sha256_bytes_hex(bytes),
            size_bytes: bytes.len() as u64,
        };
        payloads.insert(KEYRING_BUNDLE_ZIP_PATH.to_string(), (entry, bytes.clone()));
    }

    for (zip_path, (entry, data)) in &payloads {
        writer.start_file(zip_path.as_str(), zip_options)?;
        writer.write_all(data)?;
        entries.push(entry.clone());
    }
    entries.sort_by(|a, b| (a.kind.as_str(), a.relpath.as_str()).cmp(&(b.kind.as_str(), b.relpath.as_str())));

    let manifest = BackupManifest {
        schema_version: 1,
        created_utc: canonical::now_ts_utc(),
        entries: entries.clone(),
        includes_data: options.include_data,
        includes_keyring_bundle: keyring_bundle_bytes.is_some(),
    };
    writer.start_file("bundle_manifest.json", zip_options)?;
    writer.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())?;
    writer.finish()?;

    info!(path = %output_path.display(), entries = entries.len(), "backup bundle written");
    Ok(BackupReport {
        path: output_path.to_path_buf(),
        entries: entries.len(),
        includes_data: options.include_data,
        includes_keyring_bundle: keyring_bundle_bytes.is_some(),
    })
}

/// Restore a backup bundle. Every entry hash is verified before any write;
/// conflicting destination files are archived, never deleted.
pub fn restore_backup_bundle(
    bundle_path: &Path,
    repo: &Path,
    config_dir: &Path,
    data_dir: &Path,
    keyring_bundle_passphrase: Option<&str>,
    overwrite: bool,
) -> Result<RestoreReport, ArchiveError> {
    let mut archive = ZipArchive::new(File::open(bundle_path)?)?;
    let manifest: BackupManifest = {
        let mut entry = archive
            .by_name("bundle_manifest.json")
            .map_err(|_| ArchiveError::BundleInvalid("manifest_missing".into()))?;
        let mut raw = String::new();
        entry.read_to_string(&mut raw)?;
        serde_json::from_str(&raw)?
    };

    // Verify everything before the first write.
    let mut issues = Vec::new();
    let mut contents: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for entry in &manifest.entries {
        let mut data = Vec::new();
        match archive.by_name(&entry.zip_path) {
            Ok(mut file) => {
                file.read_to_end(&mut data)?;
            }
            Err(_) => {
                issues.push(format!("missing_entry:{}", entry.zip_path));
                continue;
            }
        }
        if sha256_bytes_hex(&data) != entry.sha256 {
            issues.push(format!("sha256_mismatch:{}", entry.zip_path));
            continue;
        }
        contents.insert(entry.zip_path.clone(), data);
    }
    if !issues.is_empty() {
        return Err(ArchiveError::IntegrityCheckFailed(issues));
    }

    let mut extracted = 0usize;
    let mut archived = Vec::new();
    for entry in &manifest.entries {
        if entry.zip_path == KEYRING_BUNDLE_ZIP_PATH {
            continue;
        }
        let dest = match entry.kind.as_str() {
            "repo" => repo.join(&entry.relpath),
            "config" => config_dir.join(&entry.relpath),
            "data" => data_dir.join(&entry.relpath),
            _ => continue,
        };
        if dest.exists() && !overwrite {
            archived.push(archive_existing(&dest)?);
        }
        atomic_write(&dest, &contents[&entry.zip_path])?;
        extracted += 1;
    }

    if manifest.includes_keyring_bundle {
        let passphrase = keyring_bundle_passphrase.ok_or(ArchiveError::MissingPassphrase)?;
        let bundle_bytes = contents
            .get(KEYRING_BUNDLE_ZIP_PATH)
            .ok_or_else(|| ArchiveError::BundleInvalid("keyring_bundle_missing".into()))?;
        let dest_keyring = data_dir.join("vault/keyring.json");
        if dest_keyring.exists() && !overwrite {
            archived.push(archive_existing(&dest_keyring)?);
        }
        let tmp = tempfile_path(bundle_path, "restore.keyring.bundle.json");
        fs::write(&tmp, bundle_bytes)?;
        let imported = import_keyring_bundle(&tmp, passphrase, &dest_keyring, false, None);
        let _ = fs::remove_file(&tmp);
        imported?;
    }

    info!(extracted, archived = archived.len(), "backup restore complete");
    Ok(RestoreReport { extracted, archived })
}

fn archive_existing(path: &Path) -> Result<PathBuf, ArchiveError> {
    let ts = Utc::now().format("%Y%m%dT%H%M%SZ");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let archived = path.with_file_name(format!("{name}.bak.{ts}"));
    fs::rename(path, &archived)?;
    Ok(archived)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ArchiveError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_file_name(format!(
        ".{}.tmp",
        path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
    ));
    {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tempfile_path(near: &Path, name: &str) -> PathBuf {
    near.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{name}.tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Roots {
        dir: TempDir,
        repo: PathBuf,
        config: PathBuf,
        data: PathBuf,
    }

    fn roots() -> Roots {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        let config = dir.path().join("config");
        let data = dir.path().join("data");
        fs::create_dir_all(repo.join("config")).unwrap();
        fs::create_dir_all(&config).unwrap();
        fs::create_dir_all(data.join("vault")).unwrap();
        fs::write(config.join("user.json"), b"{\"user\": true}").unwrap();
        fs::write(repo.join("config/plugin_locks.json"), b"{}").unwrap();
        fs::write(data.join("ledger.ndjson"), b"{\"entry\":1}\n").unwrap();
        fs::write(data.join("journal.ndjson"), b"{\"event\":1}\n").unwrap();
        fs::write(data.join("anchors.ndjson"), b"{\"anchor_seq\":0}\n").unwrap();
        // A real keyring for the bundle export.
        Keyring::load(data.join("vault/keyring.json"), LoadOptions::default()).unwrap();
        Roots {
            dir,
            repo,
            config,
            data,
        }
    }

    fn options() -> BackupOptions {
        BackupOptions {
            include_data: false,
            include_keyring_bundle: true,
            keyring_bundle_passphrase: Some("backup-pass".to_string()),
            overwrite: false,
        }
    }

    #[test]
    fn create_and_restore_round_trip() {
        let src = roots();
        let bundle = src.dir.path().join("backup.zip");
        let report = create_backup_bundle(
            &bundle,
            &src.repo,
            &src.config,
            &src.data,
            &src.data.join("vault/keyring.json"),
            &options(),
        )
        .unwrap();
        assert!(report.includes_keyring_bundle);
        assert!(report.entries >= 5);

        let dst = roots();
        let restore = restore_backup_bundle(
            &bundle,
            &dst.repo,
            &dst.config,
            &dst.data,
            Some("backup-pass"),
            false,
        )
        .unwrap();
        assert!(restore.extracted >= 4);
        // Conflicting files were archived, not unlinked.
        assert!(!restore.archived.is_empty());
        for archived in &restore.archived {
            assert!(archived.exists());
            assert!(archived.to_string_lossy().contains(".bak."));
        }
        assert_eq!(fs::read(dst.data.join("ledger.ndjson")).unwrap(), b"{\"entry\":1}\n");
        // The restored keyring decrypts with the source's keys.
        let restored =
            Keyring::load(dst.data.join("vault/keyring.json"), LoadOptions::default()).unwrap();
        let source =
            Keyring::load(src.data.join("vault/keyring.json"), LoadOptions::default()).unwrap();
        for purpose in source.purposes() {
            assert_eq!(restored.active_key_id(purpose), source.active_key_id(purpose));
        }
    }

    #[test]
    fn corrupted_bundle_makes_no_changes() {
        let src = roots();
        let bundle = src.dir.path().join("backup.zip");
        create_backup_bundle(
            &bundle,
            &src.repo,
            &src.config,
            &src.data,
            &src.data.join("vault/keyring.json"),
            &options(),
        )
        .unwrap();

        // Flip a byte inside the ledger entry of the zip.
        let mut archive = ZipArchive::new(File::open(&bundle).unwrap()).unwrap();
        let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
        for idx in 0..archive.len() {
            let mut entry = archive.by_index(idx).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            if entry.name() == "data/ledger.ndjson" {
                data[0] ^= 0xff;
            }
            entries.push((entry.name().to_string(), data));
        }
        let mut writer = ZipWriter::new(File::create(&bundle).unwrap());
        let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, data) in entries {
            writer.start_file(name.as_str(), opts).unwrap();
            writer.write_all(&data).unwrap();
        }
        writer.finish().unwrap();

        let dst = roots();
        let before = fs::read(dst.data.join("ledger.ndjson")).unwrap();
        let result = restore_backup_bundle(
            &bundle,
            &dst.repo,
            &dst.config,
            &dst.data,
            Some("backup-pass"),
            false,
        );
        assert!(matches!(result, Err(ArchiveError::IntegrityCheckFailed(_))));
        assert_eq!(fs::read(dst.data.join("ledger.ndjson")).unwrap(), before);
    }

    #[test]
    fn missing_required_config_fails_fast() {
        let src = roots();
        fs::remove_file(src.config.join("user.json")).unwrap();
        let result = create_backup_bundle(
            &src.dir.path().join("backup.zip"),
            &src.repo,
            &src.config,
            &src.data,
            &src.data.join("vault/keyring.json"),
            &options(),
        );
        assert!(matches!(result, Err(ArchiveError::MissingRequiredPath(_))));
    }
}
