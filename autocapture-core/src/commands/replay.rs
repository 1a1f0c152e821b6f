use anyhow::Result;
use keyring::{Keyring, LoadOptions};
use serde_json::json;

use crate::env::Dirs;
use crate::{ReplayArgs, EXIT_INTEGRITY, EXIT_OK};

/// `replay <bundle.zip>`: offline verification including citations.
pub fn run(dirs: &Dirs, args: &ReplayArgs) -> Result<u8> {
    let keyring = if dirs.keyring_path().exists() {
        Some(Keyring::load(dirs.keyring_path(), LoadOptions::default())?)
    } else {
        None
    };
    let report = proof::replay_bundle(&args.bundle, keyring.as_ref())?;
    let summary = json!({
        "ok": report.ok,
        "ledger_ok": report.ledger_ok,
        "anchor_ok": report.anchor_ok,
        "citations_ok": report.citations_ok,
        "policy_snapshot_ok": report.policy_snapshot_ok,
        "errors": report.errors,
        "citation_errors": report.citation_errors,
    });
    if report.ok {
        println!("{summary}");
        Ok(EXIT_OK)
    } else {
        eprintln!("{summary}");
        Ok(EXIT_INTEGRITY)
    }
}
