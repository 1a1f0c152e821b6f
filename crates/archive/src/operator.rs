//! Operator action auditing: every CLI mutation is append-only evidence.

use ledger::EventBuilder;
use serde_json::{json, Map, Value};

use crate::error::ArchiveError;

/// Record an operator command as a journal event plus a hash-chained ledger
/// entry. Returns `(event_id, ledger_hash)`.
pub fn record_operator_action(
    events: &EventBuilder,
    action: &str,
    payload: Option<&Value>,
    entry_id: Option<&str>,
) -> Result<(String, String), ArchiveError> {
    let mut body = Map::new();
    body.insert("schema_version".into(), json!(1));
    body.insert("action".into(), json!(action));
    if let Some(Value::Object(extra)) = payload {
        for (key, value) in extra {
            body.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    let body = Value::Object(body);
    let event_type = format!("operator.{action}");
    let event_id = events.journal_event(&event_type, &body, entry_id, None)?;
    let ledger_hash = events.ledger_entry(&event_type, &[], &[], Some(&body), entry_id, None)?;
    Ok((event_id, ledger_hash))
}
