use anyhow::{Context as _, Result};
use serde_json::{json, Value};

use crate::context::KernelContext;
use crate::env::Dirs;
use crate::{ExportChatgptArgs, ExportProofArgs, EXIT_INTEGRITY, EXIT_OK};

/// `export proof --evidence-id ID... [--citations FILE] --out FILE`
pub fn proof(dirs: &Dirs, args: &ExportProofArgs) -> Result<u8> {
    let ctx = KernelContext::open(dirs.clone())?;
    let citations: Option<Vec<Value>> = match &args.citations {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading citations file {}", path.display()))?;
            Some(serde_json::from_str(&raw).context("parsing citations JSON")?)
        }
        None => None,
    };
    let out = if args.out.is_absolute() {
        args.out.clone()
    } else {
        dirs.bundle_dir.join(&args.out)
    };
    let report = proof::export_proof_bundle(
        &ctx.metadata,
        &ctx.media,
        Some(ctx.keyring.as_ref()),
        &dirs.ledger_path(),
        &dirs.anchor_path(),
        &out,
        &args.evidence_ids,
        citations.as_deref(),
    )?;
    archive::record_operator_action(
        &ctx.events,
        "export_proof",
        Some(&json!({
            "output_path": report.output_path,
            "evidence_count": report.evidence_ids.len(),
            "derived_count": report.derived_ids.len(),
        })),
        None,
    )?;
    let summary = json!({
        "ok": report.ok,
        "output_path": report.output_path,
        "evidence_ids": report.evidence_ids,
        "derived_ids": report.derived_ids.len(),
        "edge_ids": report.edge_ids.len(),
        "ledger_entries": report.ledger_entries,
        "anchors": report.anchors,
        "blobs": report.blobs,
        "errors": report.errors,
        "warnings": report.warnings,
    });
    if report.ok {
        println!("{summary}");
        Ok(EXIT_OK)
    } else {
        eprintln!("{summary}");
        Ok(EXIT_INTEGRITY)
    }
}

/// `export chatgpt [--max-segments N] [--since-ts ISO8601]`
pub fn chatgpt(dirs: &Dirs, args: &ExportChatgptArgs) -> Result<u8> {
    let ctx = KernelContext::open(dirs.clone())?;
    let report = archive::export_chatgpt_transcripts(
        &dirs.data_dir,
        &ctx.metadata,
        args.since_ts.as_deref(),
        args.max_segments,
        None,
    )?;
    archive::record_operator_action(
        &ctx.events,
        "export_chatgpt",
        Some(&json!({
            "output_path": report.output_path,
            "segments": report.segments,
        })),
        None,
    )?;
    println!(
        "{}",
        json!({
            "ok": true,
            "output_path": report.output_path,
            "segments": report.segments,
            "rows_written": report.rows_written,
            "head_hash": report.head_hash,
        })
    );
    Ok(EXIT_OK)
}
