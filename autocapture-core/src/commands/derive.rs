use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::json;
use sst::{
    DerivationJob, DerivationPool, ExtractorRegistry, RunLimits, SstConfig, SstPersistence,
    SstPipeline,
};

use crate::context::KernelContext;
use crate::env::Dirs;
use crate::{DeriveArgs, EXIT_OK};

/// `derive --record-id ID...`: run the SST pipeline over already-captured
/// frames. OCR/VLM providers are capture-side plugins; without them the
/// pipeline still emits frame traces and state envelopes.
pub fn run(dirs: &Dirs, args: &DeriveArgs) -> Result<u8> {
    let ctx = KernelContext::open(dirs.clone())?;
    let events = Arc::new(ctx.events);
    let config = SstConfig::default();
    let persistence = SstPersistence::new(
        ctx.metadata.clone(),
        Some(events.clone()),
        None,
        "sst.core",
        env!("CARGO_PKG_VERSION"),
        &sst::config_hash(&config),
        config.schema_version,
    );
    let pipeline = Arc::new(SstPipeline::new(
        config,
        ExtractorRegistry::new(),
        None,
        persistence,
    ));

    let mut jobs = Vec::new();
    for record_id in &args.record_ids {
        let Some(record) = ctx.metadata.get(record_id)? else {
            bail!("evidence record not found: {record_id}");
        };
        let Some(frame_bytes) = ctx.media.get(record_id)? else {
            bail!("blob not found for evidence record: {record_id}");
        };
        jobs.push(DerivationJob {
            record_id: record_id.clone(),
            record,
            frame_bytes,
            allow_ocr: !args.no_ocr,
            allow_vlm: false,
        });
    }

    let cpu_workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let pool = DerivationPool::new(pipeline, cpu_workers);
    let results = pool.process_batch(jobs, &RunLimits::none());

    let mut summaries = Vec::new();
    for (record_id, result) in args.record_ids.iter().zip(results) {
        match result {
            Some(result) => summaries.push(json!({
                "record_id": result.record_id,
                "boundary": result.boundary,
                "boundary_reason": result.boundary_reason,
                "heavy_ran": result.heavy_ran,
                "derived_records": result.derived_records,
                "derived_ids": result.derived_ids,
            })),
            None => summaries.push(json!({"record_id": record_id, "skipped": true})),
        }
    }
    println!("{}", json!({"ok": true, "results": summaries}));
    Ok(EXIT_OK)
}
