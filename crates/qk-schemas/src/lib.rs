//! Shared domain records for the quota ledger.
//!
//! Field names serialize in camelCase because these shapes double as the
//! store field maps and the wire format consumed by holder clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a redemption code.
///
/// `Revoked` is terminal. `Exhausted` is reversible back to `Active`
/// whenever a reservation rollback drops `used` below `quota_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeStatus {
    Active,
    Exhausted,
    Revoked,
}

impl CodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeStatus::Active => "active",
            CodeStatus::Exhausted => "exhausted",
            CodeStatus::Revoked => "revoked",
        }
    }
}

/// State of a single reservation. `Reserved` is initial; `Committed` and
/// `Canceled` are terminal and mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Reserved,
    Committed,
    Canceled,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "reserved",
            ReservationState::Committed => "committed",
            ReservationState::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationState::Reserved)
    }
}

/// One redemption code. Never deleted; retained for audit even after
/// revocation or exhaustion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeRecord {
    /// Immutable after creation.
    pub quota_total: u32,
    /// Committed + currently-leased reservations. `0 <= used <= quota_total`
    /// at every quiescent point.
    pub used: u32,
    pub status: CodeStatus,
    pub created_at: DateTime<Utc>,
    /// Opaque device token; set at most once unless an administrator resets it.
    pub bound_device_hash: Option<String>,
    pub bind_reset_count: u32,
    pub bind_reset_at: Option<DateTime<Utc>>,
    /// Administrative annotation, never shown to holders.
    pub note: Option<String>,
}

impl CodeRecord {
    pub fn new(quota_total: u32, note: Option<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            quota_total,
            used: 0,
            status: CodeStatus::Active,
            created_at,
            bound_device_hash: None,
            bind_reset_count: 0,
            bind_reset_at: None,
            note,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.quota_total.saturating_sub(self.used)
    }
}

/// A short-lived hold against a code's quota, made durable before the
/// caller performs the work it gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRecord {
    pub code: String,
    pub device_hash: String,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    /// Stored lease deadline; the store also enforces a matching key TTL.
    pub expires_at: DateTime<Utc>,
}

/// Administrative listing row. `code` is masked (`ABCD-****`); the full
/// code appears only in `code_full`, surfaced behind the admin gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSummary {
    pub code: String,
    pub code_full: String,
    pub remaining: u32,
    pub quota_total: u32,
    pub used: u32,
    pub status: CodeStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub bound_device_hash: Option<String>,
    pub bind_reset_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_never_underflows() {
        let mut rec = CodeRecord::new(3, None, Utc::now());
        rec.used = 5;
        assert_eq!(rec.remaining(), 0);
    }

    #[test]
    fn status_serializes_lowercase() {
        let s = serde_json::to_string(&CodeStatus::Exhausted).unwrap();
        assert_eq!(s, "\"exhausted\"");
    }
}
