//! Request and response types for all qk-daemon HTTP endpoints.
//!
//! JSON field names are camelCase to match what holder clients send and
//! receive. No business logic lives here.

use chrono::{DateTime, Utc};
use qk_audit::AuditEntry;
use qk_schemas::{CodeStatus, CodeSummary};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Uniform error body. `retry_after` (seconds) rides along only on 429s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
            retry_after: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Holder operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemRequest {
    pub code: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    pub ok: bool,
    pub remaining: u32,
    pub quota_total: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub code: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub ok: bool,
    pub remaining: u32,
    pub quota_total: u32,
    pub status: CodeStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub code: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveResponse {
    pub ok: bool,
    pub reservation_id: String,
    pub remaining: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleRequest {
    pub reservation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// Admin operations (x-admin-secret gated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCodeRequest {
    pub quota_total: u32,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCodeResponse {
    pub ok: bool,
    pub code: String,
    pub quota_total: u32,
    /// Holder-facing redeem link.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListCodesResponse {
    pub ok: bool,
    pub codes: Vec<CodeSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupQuery {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupResponse {
    pub ok: bool,
    pub code: String,
    pub quota_total: u32,
    pub used: u32,
    pub remaining: u32,
    pub status: CodeStatus,
    pub created_at: DateTime<Utc>,
    pub bound_device_hash: Option<String>,
    pub bind_reset_count: u32,
    pub bind_reset_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    /// Recent audit entries, newest first.
    pub history: Vec<AuditEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeActionRequest {
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetBindingResponse {
    pub ok: bool,
    pub bind_reset_count: u32,
}
