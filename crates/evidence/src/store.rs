//! Immutability gate over the raw metadata store.

use std::sync::Arc;

use canonical::to_canonical_string;
use serde_json::Value;
use storage::{RawStore, StoreError};
use tracing::debug;

use crate::error::EvidenceError;
use crate::schema::{is_derived_record, is_evidence_record, validate_record};

/// Wraps a [`RawStore`] with the append-only contract: evidence and derived
/// records are immutable once written, and only derived records may be
/// deleted.
#[derive(Clone)]
pub struct ImmutableMetadataStore {
    inner: Arc<dyn RawStore>,
}

impl ImmutableMetadataStore {
    pub fn new(inner: Arc<dyn RawStore>) -> Self {
        Self { inner }
    }

    pub fn get(&self, record_id: &str) -> Result<Option<Value>, EvidenceError> {
        Ok(self.inner.get(record_id)?)
    }

    pub fn keys(&self) -> Result<Vec<String>, EvidenceError> {
        Ok(self.inner.keys()?)
    }

    /// Append-compatible put: re-writing an evidence/derived record with a
    /// byte-identical payload is a no-op; any other mutation is rejected.
    pub fn put(&self, record_id: &str, value: &Value) -> Result<(), EvidenceError> {
        validate_record(record_id, value)?;
        if let Some(existing) = self.inner.get(record_id)? {
            if is_evidence_record(&existing) || is_derived_record(&existing) {
                if canonical_eq(&existing, value)? {
                    debug!(record_id, "identical immutable payload, no-op");
                    return Ok(());
                }
                return Err(EvidenceError::Immutable(record_id.to_string()));
            }
            if is_derived_record(value) {
                return Err(EvidenceError::Immutable(record_id.to_string()));
            }
        }
        self.inner.put(record_id, value)?;
        Ok(())
    }

    /// Strict insert: fails on any existing record.
    pub fn put_new(&self, record_id: &str, value: &Value) -> Result<(), EvidenceError> {
        validate_record(record_id, value)?;
        match self.inner.put_new(record_id, value) {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict(id)) => Err(EvidenceError::Conflict(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace is allowed only for records that are neither evidence nor
    /// derived, on both sides (run manifests, export markers).
    pub fn put_replace(&self, record_id: &str, value: &Value) -> Result<(), EvidenceError> {
        validate_record(record_id, value)?;
        if is_evidence_record(value) || is_derived_record(value) {
            return Err(EvidenceError::Immutable(record_id.to_string()));
        }
        if let Some(existing) = self.inner.get(record_id)? {
            if is_evidence_record(&existing) || is_derived_record(&existing) {
                return Err(EvidenceError::Immutable(record_id.to_string()));
            }
        }
        self.inner.put(record_id, value)?;
        Ok(())
    }

    /// Best-effort multi-insert: existing IDs are filtered out, the rest are
    /// inserted individually; returns the IDs actually inserted.
    pub fn put_batch(&self, records: &[(String, Value)]) -> Result<Vec<String>, EvidenceError> {
        let mut inserted = Vec::new();
        for (record_id, value) in records {
            if validate_record(record_id, value).is_err() {
                continue;
            }
            if self.inner.get(record_id)?.is_some() {
                continue;
            }
            match self.inner.put_new(record_id, value) {
                Ok(()) => inserted.push(record_id.clone()),
                Err(StoreError::Conflict(_)) => continue,
                Err(err) => {
                    debug!(record_id, %err, "batch insert failed for record");
                    continue;
                }
            }
        }
        Ok(inserted)
    }

    /// Delete is legal only for derived records; deleting a missing record
    /// returns `false`.
    pub fn delete(&self, record_id: &str) -> Result<bool, EvidenceError> {
        let Some(existing) = self.inner.get(record_id)? else {
            return Ok(false);
        };
        if !is_derived_record(&existing) {
            return Err(EvidenceError::DeletePolicy(record_id.to_string()));
        }
        Ok(self.inner.delete(record_id)?)
    }
}

fn canonical_eq(a: &Value, b: &Value) -> Result<bool, EvidenceError> {
    Ok(to_canonical_string(a)? == to_canonical_string(b)?)
}
