//! Directory resolution from environment variables.

use std::path::PathBuf;

pub const ENV_DATA_DIR: &str = "AUTOCAPTURE_DATA_DIR";
pub const ENV_CONFIG_DIR: &str = "AUTOCAPTURE_CONFIG_DIR";
pub const ENV_ROOT: &str = "AUTOCAPTURE_ROOT";
pub const ENV_BUNDLE_DIR: &str = "AUTOCAPTURE_BUNDLE_DIR";

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone)]
pub struct Dirs {
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub bundle_dir: PathBuf,
}

impl Dirs {
    pub fn resolve() -> Self {
        let root = env_path(ENV_ROOT).unwrap_or_else(|| PathBuf::from("."));
        let data_dir = env_path(ENV_DATA_DIR).unwrap_or_else(|| root.join("data"));
        let config_dir = env_path(ENV_CONFIG_DIR).unwrap_or_else(|| root.join("config"));
        let bundle_dir = env_path(ENV_BUNDLE_DIR).unwrap_or_else(|| data_dir.join("exports"));
        Self {
            root,
            data_dir,
            config_dir,
            bundle_dir,
        }
    }

    pub fn keyring_path(&self) -> PathBuf {
        self.data_dir.join("vault/keyring.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.ndjson")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.ndjson")
    }

    /// Anchors default beside the ledger; a legacy `data_anchor/` location
    /// is honored when present.
    pub fn anchor_path(&self) -> PathBuf {
        let legacy = self.data_dir.join("data_anchor/anchors.ndjson");
        if legacy.exists() {
            return legacy;
        }
        self.data_dir.join("anchors.ndjson")
    }
}
