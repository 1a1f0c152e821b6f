use anyhow::Result;
use serde_json::json;

use crate::context::KernelContext;
use crate::env::Dirs;
use crate::{CompactDerivedArgs, EXIT_OK};

/// `compact derived [--dry-run]`
pub fn derived(dirs: &Dirs, args: &CompactDerivedArgs) -> Result<u8> {
    let ctx = KernelContext::open(dirs.clone())?;
    let result = archive::compact_derived(
        &ctx.metadata,
        &ctx.media,
        &dirs.data_dir,
        args.dry_run,
        Some(&ctx.events),
    )?;
    if !args.dry_run {
        archive::record_operator_action(
            &ctx.events,
            "compact_derived",
            Some(&json!({
                "derived_metadata": result.derived_metadata,
                "derived_media": result.derived_media,
                "freed_bytes": result.freed_bytes,
            })),
            None,
        )?;
    }
    println!(
        "{}",
        json!({
            "ok": true,
            "dry_run": result.dry_run,
            "derived_metadata": result.derived_metadata,
            "derived_media": result.derived_media,
            "removed_index_files": result.removed_index_files,
            "freed_bytes": result.freed_bytes,
        })
    );
    Ok(EXIT_OK)
}
