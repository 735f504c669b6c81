//! The quota ledger: code lifecycle (activation, binding, spend,
//! exhaustion, revocation) and the two-phase reserve/commit/cancel
//! lifecycle for individual reservations.
//!
//! Every read-then-write on ledger state goes through one of the store's
//! named atomic transitions; the plain reads here are pre-checks whose
//! outcome is always re-verified inside the transition. That is what makes
//! concurrent redeems single-binder and concurrent reserves overshoot-free
//! without any in-process locking.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use qk_audit::{AuditEntry, AuditOutcome};
use qk_codes::MintError;
use qk_schemas::{CodeRecord, CodeStatus, CodeSummary, ReservationRecord, ReservationState};
use qk_store::{
    BindOutcome, CancelOutcome, CommitOutcome, QuotaStore, ReserveOutcome, StoreError,
};

pub mod reconcile;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Terminal operation failures, surfaced to the caller with enough context
/// to render a user message. The ledger never retries on its own.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("code not found")]
    NotFound,
    #[error("code has been revoked")]
    Revoked,
    #[error("code is exhausted")]
    Exhausted,
    #[error("code is not active")]
    NotActive,
    #[error("code is bound to another device")]
    DeviceMismatch,
    #[error("reservation was already committed")]
    AlreadyCommitted,
    #[error("reservation was already canceled")]
    AlreadyCanceled,
    #[error("quota must be between 1 and {max}")]
    InvalidQuota { max: u32 },
    #[error(transparent)]
    Mint(#[from] MintError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Ledger tunables. Tests shrink `reservation_ttl` to exercise lease expiry
/// without waiting out the production lease.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Reservation lease; enforced both as the store key TTL and as the
    /// stored `expires_at` field.
    pub reservation_ttl: Duration,
    /// Administrative ceiling for `quota_total` at activation.
    pub max_quota: u32,
    /// How many audit entries `history` returns.
    pub history_limit: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::from_secs(120),
            max_quota: 9999,
            history_limit: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivatedCode {
    pub code: String,
    pub quota_total: u32,
}

/// Remaining headroom as seen after a redeem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaView {
    pub remaining: u32,
    pub quota_total: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusView {
    pub remaining: u32,
    pub quota_total: u32,
    pub status: CodeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedUnit {
    pub reservation_id: String,
    /// Post-increment headroom.
    pub remaining: u32,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// All cross-request coordination happens through the injected store; the
/// ledger itself is stateless and freely cloneable across request handlers.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn QuotaStore>,
    cfg: LedgerConfig,
}

impl Ledger {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    pub fn with_config(store: Arc<dyn QuotaStore>, cfg: LedgerConfig) -> Self {
        Self { store, cfg }
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    // ---- administrative ----

    /// Mint a code and create its record with `status = active`, `used = 0`.
    pub async fn activate(
        &self,
        quota_total: u32,
        note: Option<String>,
    ) -> LedgerResult<ActivatedCode> {
        if quota_total == 0 || quota_total > self.cfg.max_quota {
            return Err(LedgerError::InvalidQuota {
                max: self.cfg.max_quota,
            });
        }

        // Minting pre-checks uniqueness, but the record write is
        // first-writer-wins, so a lost race just means another attempt.
        for _ in 0..3 {
            let code = qk_codes::mint(self.store.as_ref()).await?;
            let record = CodeRecord::new(quota_total, note.clone(), Utc::now());
            if self.store.create_code(&code, &record).await? {
                info!(code = %qk_codes::mask(&code), quota_total, "code activated");
                return Ok(ActivatedCode { code, quota_total });
            }
        }
        Err(MintError::GenerationExhausted.into())
    }

    /// Revoke unconditionally. Terminal; no quota effect.
    pub async fn revoke(&self, code: &str) -> LedgerResult<()> {
        if self.store.fetch_code(code).await?.is_none() {
            return Err(LedgerError::NotFound);
        }
        self.store.set_status(code, CodeStatus::Revoked).await?;
        info!(code = %qk_codes::mask(code), "code revoked");
        Ok(())
    }

    /// Clear the device binding so a new device can bind on its next redeem.
    /// Returns the incremented reset count. `used` is untouched.
    pub async fn reset_binding(&self, code: &str) -> LedgerResult<u32> {
        if self.store.fetch_code(code).await?.is_none() {
            return Err(LedgerError::NotFound);
        }
        let count = self.store.clear_binding(code, Utc::now()).await?;
        info!(code = %qk_codes::mask(code), reset_count = count, "binding reset");
        Ok(count)
    }

    /// Administrative listing, newest first. Codes are masked; the full
    /// code rides along for the admin surface only.
    pub async fn list_codes(&self) -> LedgerResult<Vec<CodeSummary>> {
        let mut summaries = Vec::new();
        for code in self.store.list_codes().await? {
            if let Some(rec) = self.store.fetch_code(&code).await? {
                summaries.push(CodeSummary {
                    code: qk_codes::mask(&code),
                    code_full: code,
                    remaining: rec.remaining(),
                    quota_total: rec.quota_total,
                    used: rec.used,
                    status: rec.status,
                    note: rec.note,
                    created_at: rec.created_at,
                    bound_device_hash: rec.bound_device_hash,
                    bind_reset_count: rec.bind_reset_count,
                });
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Recent audit entries for a code (admin surface).
    pub async fn history(&self, code: &str) -> LedgerResult<Vec<AuditEntry>> {
        if self.store.fetch_code(code).await?.is_none() {
            return Err(LedgerError::NotFound);
        }
        let entries =
            qk_audit::read_recent(self.store.as_ref(), code, self.cfg.history_limit).await?;
        Ok(entries)
    }

    // ---- holder operations ----

    /// Bind-and-redeem: verify the code, bind it to this device if unbound
    /// (atomic check-and-set: exactly one of N racing devices wins), sweep
    /// abandoned reservations, and report remaining quota.
    pub async fn redeem(&self, code: &str, device_id: &str) -> LedgerResult<QuotaView> {
        let device_hash = qk_codes::device_hash(device_id);
        let rec = self
            .store
            .fetch_code(code)
            .await?
            .ok_or(LedgerError::NotFound)?;

        match rec.status {
            CodeStatus::Revoked => return Err(LedgerError::Revoked),
            CodeStatus::Exhausted => return Err(LedgerError::Exhausted),
            CodeStatus::Active => {}
        }

        match rec.bound_device_hash.as_deref() {
            Some(bound) if bound != device_hash => return Err(LedgerError::DeviceMismatch),
            Some(_) => {}
            None => match self.store.bind_device(code, &device_hash).await? {
                BindOutcome::Bound => {}
                // A concurrent redeemer bound it first.
                BindOutcome::Mismatch => return Err(LedgerError::DeviceMismatch),
            },
        }

        self.sweep(code).await?;
        let rec = self
            .store
            .fetch_code(code)
            .await?
            .ok_or(LedgerError::NotFound)?;
        info!(code = %qk_codes::mask(code), remaining = rec.remaining(), "redeem");
        Ok(QuotaView {
            remaining: rec.remaining(),
            quota_total: rec.quota_total,
        })
    }

    /// Current quota view for a bound device. Runs the sweep so reclaimed
    /// leases are already reflected in the answer.
    pub async fn status(&self, code: &str, device_id: &str) -> LedgerResult<StatusView> {
        let device_hash = qk_codes::device_hash(device_id);
        let rec = self
            .store
            .fetch_code(code)
            .await?
            .ok_or(LedgerError::NotFound)?;

        if let Some(bound) = rec.bound_device_hash.as_deref() {
            if bound != device_hash {
                return Err(LedgerError::DeviceMismatch);
            }
        }

        self.sweep(code).await?;
        let rec = self
            .store
            .fetch_code(code)
            .await?
            .ok_or(LedgerError::NotFound)?;
        Ok(StatusView {
            remaining: rec.remaining(),
            quota_total: rec.quota_total,
            status: rec.status,
        })
    }

    /// Reserve one unit of quota under a fresh lease. The binding must
    /// already match (reserve never creates a binding). The spend itself is
    /// the store's increment-and-threshold transition, so two racing
    /// reserves can never both take the last unit.
    pub async fn reserve(&self, code: &str, device_id: &str) -> LedgerResult<ReservedUnit> {
        let device_hash = qk_codes::device_hash(device_id);
        let rec = self
            .store
            .fetch_code(code)
            .await?
            .ok_or(LedgerError::NotFound)?;

        if rec.status == CodeStatus::Revoked {
            return Err(LedgerError::Revoked);
        }
        if rec.bound_device_hash.as_deref() != Some(device_hash.as_str()) {
            return Err(LedgerError::DeviceMismatch);
        }

        self.sweep(code).await?;

        let remaining = match self.store.reserve_unit(code).await? {
            ReserveOutcome::NotActive => return Err(LedgerError::NotActive),
            ReserveOutcome::Exhausted => return Err(LedgerError::Exhausted),
            ReserveOutcome::Reserved { remaining } => remaining,
        };

        let reservation_id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.cfg.reservation_ttl)
            .map_err(|e| anyhow::anyhow!("reservation ttl out of range: {e}"))?;
        let record = ReservationRecord {
            code: code.to_string(),
            device_hash,
            state: ReservationState::Reserved,
            created_at: now,
            expires_at: now + lease,
        };
        self.store
            .create_reservation(&reservation_id, &record, self.cfg.reservation_ttl)
            .await?;

        debug!(code = %qk_codes::mask(code), remaining, "unit reserved");
        Ok(ReservedUnit {
            reservation_id,
            remaining,
        })
    }

    /// Settle a reservation as spent. Idempotent: a vanished or
    /// already-committed reservation is success (the caller may be retrying,
    /// or racing the reconciler). Committing a rolled-back reservation is a
    /// genuine contradiction and fails with `AlreadyCanceled`.
    pub async fn commit(&self, reservation_id: &str) -> LedgerResult<()> {
        let resv = match self.store.fetch_reservation(reservation_id).await? {
            None => return Ok(()),
            Some(r) => r,
        };
        match resv.state {
            ReservationState::Committed => return Ok(()),
            ReservationState::Canceled => return Err(LedgerError::AlreadyCanceled),
            ReservationState::Reserved => {}
        }

        match self
            .store
            .commit_reservation(reservation_id, &resv.code)
            .await?
        {
            CommitOutcome::Committed => {
                let entry = AuditEntry::new(
                    reservation_id,
                    &resv.code,
                    &resv.device_hash,
                    AuditOutcome::Committed,
                );
                qk_audit::append(self.store.as_ref(), &entry).await?;
                info!(code = %qk_codes::mask(&resv.code), "reservation committed");
                Ok(())
            }
            CommitOutcome::AlreadyCommitted | CommitOutcome::Vanished => Ok(()),
            CommitOutcome::AlreadyCanceled => Err(LedgerError::AlreadyCanceled),
        }
    }

    /// Roll back a reservation. Idempotent for vanished or already-canceled
    /// reservations; canceling a committed one fails with
    /// `AlreadyCommitted`. Shares the rollback transition with lease-expiry
    /// reclamation.
    pub async fn cancel(&self, reservation_id: &str) -> LedgerResult<()> {
        let resv = match self.store.fetch_reservation(reservation_id).await? {
            None => return Ok(()),
            Some(r) => r,
        };
        match resv.state {
            ReservationState::Canceled => return Ok(()),
            ReservationState::Committed => return Err(LedgerError::AlreadyCommitted),
            ReservationState::Reserved => {}
        }

        match self
            .store
            .cancel_reservation(reservation_id, &resv.code)
            .await?
        {
            CancelOutcome::Canceled => {
                let entry = AuditEntry::new(
                    reservation_id,
                    &resv.code,
                    &resv.device_hash,
                    AuditOutcome::Canceled,
                );
                qk_audit::append(self.store.as_ref(), &entry).await?;
                info!(code = %qk_codes::mask(&resv.code), "reservation canceled");
                Ok(())
            }
            CancelOutcome::Vanished => Ok(()),
            CancelOutcome::NotReserved => {
                // Raced with a settle between the pre-check and the
                // transition. Re-read to report the true terminal state.
                match self.store.fetch_reservation(reservation_id).await? {
                    Some(r) if r.state == ReservationState::Committed => {
                        Err(LedgerError::AlreadyCommitted)
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    async fn sweep(&self, code: &str) -> LedgerResult<()> {
        let stats = reconcile::sweep(self.store.as_ref(), code, Utc::now()).await?;
        if !stats.is_empty() {
            debug!(
                code = %qk_codes::mask(code),
                reclaimed = stats.reclaimed,
                expired = stats.expired,
                dropped = stats.dropped,
                "reconciler sweep"
            );
        }
        Ok(())
    }
}
