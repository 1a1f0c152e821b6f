//! Store and event-builder wiring shared by the commands.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use evidence::ImmutableMetadataStore;
use keyring::{Keyring, LoadOptions, Purpose};
use ledger::{
    persist_policy_snapshot, AnchorSchedule, AnchorWriter, EventBuilder, JournalWriter,
    LedgerWriter,
};
use serde_json::json;
use storage::{BlobStore, DerivedKeyProvider, EncryptedJsonStore, FsyncPolicy};

use crate::env::Dirs;

pub struct KernelContext {
    pub dirs: Dirs,
    pub keyring: Arc<Keyring>,
    pub metadata: ImmutableMetadataStore,
    pub media: BlobStore,
    pub events: EventBuilder,
}

impl KernelContext {
    /// Open every store under the resolved data directory and build the
    /// process-wide event builder for a fresh run.
    pub fn open(dirs: Dirs) -> Result<Self> {
        let keyring = Arc::new(
            Keyring::load(dirs.keyring_path(), LoadOptions::default())
                .context("loading keyring")?,
        );
        let raw_metadata = Arc::new(
            EncryptedJsonStore::new(
                dirs.data_dir.join("metadata"),
                DerivedKeyProvider::new(keyring.clone(), Purpose::Metadata),
                true,
                FsyncPolicy::Critical,
            )
            .context("opening metadata store")?,
        );
        let metadata = ImmutableMetadataStore::new(raw_metadata.clone());
        let media = BlobStore::new(
            dirs.data_dir.join("media"),
            DerivedKeyProvider::new(keyring.clone(), Purpose::Media),
            true,
            FsyncPolicy::Bulk,
        )
        .context("opening media store")?;

        let journal = Arc::new(JournalWriter::open(dirs.journal_path())?);
        let ledger = Arc::new(LedgerWriter::open(dirs.ledger_path())?);
        let anchor = Arc::new(AnchorWriter::open(
            dirs.anchor_path(),
            Some(keyring.clone()),
            true,
        )?);

        // CLI runs operate under an empty effective config; the snapshot is
        // still content-addressed and persisted so every ledger entry can be
        // resolved back to the policy it ran under.
        let config = json!({});
        let snapshot = persist_policy_snapshot(
            &config,
            &dirs.data_dir,
            Some(raw_metadata.as_ref() as &dyn storage::RawStore),
            None,
        )?;
        let run_id = canonical::new_run_id();
        let events = EventBuilder::new(
            run_id,
            snapshot.snapshot_hash,
            journal,
            ledger,
            Some(anchor),
            AnchorSchedule {
                every_entries: 32,
                every_minutes: 10,
            },
        );

        Ok(Self {
            dirs,
            keyring,
            metadata,
            media,
            events,
        })
    }
}
