use anyhow::Result;
use serde_json::json;

use crate::context::KernelContext;
use crate::env::Dirs;
use crate::EXIT_OK;

/// `recover`: scan the journal for begin markers without ledger commits and
/// complete them deterministically.
pub fn run(dirs: &Dirs) -> Result<u8> {
    let ctx = KernelContext::open(dirs.clone())?;
    let report = evidence::recover_incomplete_evidence_writes(
        &dirs.data_dir,
        &ctx.metadata,
        &ctx.media,
        &ctx.events,
    )?;
    println!(
        "{}",
        json!({
            "ok": report.ok,
            "candidates": report.candidates,
            "recovered": report.recovered,
            "skipped": report.skipped,
        })
    );
    Ok(EXIT_OK)
}
