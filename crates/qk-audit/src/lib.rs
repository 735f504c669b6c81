//! Append-only per-code audit trail. One settled reservation == one JSON
//! line, pushed onto the code's log through the store. Lines are canonical
//! (recursively sorted keys, compact encoding) so equal entries always
//! serialize byte-identically.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use qk_store::QuotaStore;

/// How the reservation left the `reserved` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Committed,
    Canceled,
}

/// One immutable audit entry. Carries the binding token, never the raw
/// device identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub reservation_id: String,
    pub code: String,
    pub device_hash: String,
    pub outcome: AuditOutcome,
    pub ts_utc: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        reservation_id: impl Into<String>,
        code: impl Into<String>,
        device_hash: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            reservation_id: reservation_id.into(),
            code: code.into(),
            device_hash: device_hash.into(),
            outcome,
            ts_utc: Utc::now(),
        }
    }

    /// Canonical single-line encoding.
    pub fn to_line(&self) -> Result<String> {
        canonical_json_line(self)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("parse audit entry")
    }
}

/// Append one entry to the code's log.
pub async fn append(store: &dyn QuotaStore, entry: &AuditEntry) -> Result<()> {
    let line = entry.to_line()?;
    store
        .append_log(&entry.code, &line)
        .await
        .context("append audit line failed")?;
    Ok(())
}

/// Most recent `limit` entries for a code, newest first.
pub async fn read_recent(
    store: &dyn QuotaStore,
    code: &str,
    limit: usize,
) -> Result<Vec<AuditEntry>> {
    let lines = store
        .read_log(code, limit)
        .await
        .context("read audit log failed")?;
    lines.iter().map(|l| AuditEntry::from_line(l)).collect()
}

/// Canonicalize by sorting keys recursively and emitting compact JSON.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize audit entry failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
