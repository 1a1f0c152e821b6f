//! Partitioned on-disk layout shared by the encrypted stores.
//!
//! `{root}/{enc(run_id)}/{bucket}/{YYYY}/{MM}/{DD}/{enc(record_id)}.{ext}`
//! where the bucket is `evidence` or `derived` (anything else lands in
//! `system`) and the date partition comes from the record's `ts_utc`.

use std::path::PathBuf;

use canonical::{encode_component, parse_ts_utc, run_id_of};
use chrono::{Datelike, Utc};
use serde_json::Value;

/// Bucket for a record id when no record body is available: ids whose kind
/// token starts with `derived` go to `derived`, otherwise `evidence`.
pub fn bucket_for_record_id(record_id: &str) -> &'static str {
    match record_id.split('/').nth(1) {
        Some(kind) if kind.starts_with("derived") => "derived",
        Some(_) => "evidence",
        None => "system",
    }
}

fn bucket_for(record_id: &str, value: Option<&Value>) -> &'static str {
    if let Some(record_type) = value
        .and_then(|v| v.get("record_type"))
        .and_then(|v| v.as_str())
    {
        if record_type.starts_with("derived.") {
            return "derived";
        }
        if record_type.starts_with("evidence.") {
            return "evidence";
        }
        return "system";
    }
    bucket_for_record_id(record_id)
}

fn date_partition(value: Option<&Value>) -> (i32, u32, u32) {
    let parsed = value
        .and_then(|v| v.get("ts_utc"))
        .and_then(|v| v.as_str())
        .and_then(parse_ts_utc);
    let dt = parsed.unwrap_or_else(Utc::now);
    (dt.year(), dt.month(), dt.day())
}

/// Encoded leaf file name for a record.
pub fn record_file_name(record_id: &str, ext: &str) -> String {
    format!("{}.{ext}", encode_component(record_id))
}

/// Relative path for a new record write.
pub fn record_rel_path(record_id: &str, value: Option<&Value>, ext: &str) -> PathBuf {
    let run = match run_id_of(record_id) {
        "" => "_",
        run if run == record_id => "_",
        run => run,
    };
    let bucket = bucket_for(record_id, value);
    let (year, month, day) = date_partition(value);
    PathBuf::from(encode_component(run))
        .join(bucket)
        .join(format!("{year:04}"))
        .join(format!("{month:02}"))
        .join(format!("{day:02}"))
        .join(record_file_name(record_id, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partitions_by_record_ts() {
        let record = json!({"record_type": "evidence.capture.frame", "ts_utc": "2026-03-04T05:06:07Z"});
        let rel = record_rel_path("run1/capture.frame/1", Some(&record), "json");
        let s = rel.to_string_lossy().replace('\\', "/");
        assert!(s.contains("/evidence/2026/03/04/"), "{s}");
        assert!(s.ends_with(".json"));
    }

    #[test]
    fn derived_records_use_derived_bucket() {
        let record = json!({"record_type": "derived.sst.state", "ts_utc": "2026-03-04T05:06:07Z"});
        let rel = record_rel_path("run1/derived.sst.state/x", Some(&record), "json");
        assert!(rel.to_string_lossy().replace('\\', "/").contains("/derived/"));
        assert_eq!(bucket_for_record_id("run1/derived.sst.state/x"), "derived");
        assert_eq!(bucket_for_record_id("run1/capture.frame/1"), "evidence");
    }

    #[test]
    fn file_names_never_contain_separators() {
        let name = record_file_name("a/b/c", "blob");
        assert!(!name.contains('/'));
    }
}
