//! Lazy expiry reclamation.
//!
//! No background process: the sweep is co-located in the hot path of
//! redeem/status/reserve and bounded by the code's pending-set size. A
//! reservation key that vanished from the store (its lease TTL fired) is
//! conclusive proof of abandonment; the pending-set removal inside
//! `reclaim_lost` guards the rollback so concurrent sweeps can never
//! double-decrement.

use chrono::{DateTime, Utc};

use qk_schemas::ReservationState;
use qk_store::{CancelOutcome, QuotaStore, StoreResult};

/// What one sweep did. Counters only; the sweep never blocks the caller's
/// primary operation beyond this bounded pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Rollbacks for reservation keys that had already vanished.
    pub reclaimed: u32,
    /// Proactive cancels for records seen past their `expires_at` before
    /// the store's own expiry fired (clock/latency skew).
    pub expired: u32,
    /// Pending-index entries dropped because the record had settled.
    pub dropped: u32,
}

impl SweepStats {
    pub fn is_empty(&self) -> bool {
        *self == SweepStats::default()
    }
}

/// Sweep one code's pending reservations. Each candidate is visited exactly
/// once; every arm is idempotent, so racing sweeps are harmless. Runs
/// regardless of code status — quota conservation holds for revoked codes
/// too, and the rollback transition never resurrects `revoked`.
pub async fn sweep(
    store: &dyn QuotaStore,
    code: &str,
    now: DateTime<Utc>,
) -> StoreResult<SweepStats> {
    let mut stats = SweepStats::default();

    for rid in store.pending_reservations(code).await? {
        match store.fetch_reservation(&rid).await? {
            // Lease TTL fired without commit/cancel: abandoned.
            None => {
                if store.reclaim_lost(code, &rid).await? {
                    stats.reclaimed += 1;
                }
            }
            Some(resv) if resv.state == ReservationState::Reserved && resv.expires_at <= now => {
                // Lease deadline passed but the key is still there: cancel
                // through the same rollback path as an explicit cancel.
                if store.cancel_reservation(&rid, code).await? == CancelOutcome::Canceled {
                    stats.expired += 1;
                }
            }
            Some(resv) if resv.state.is_terminal() => {
                // Settled but still indexed: cheap cleanup.
                store.remove_pending(code, &rid).await?;
                stats.dropped += 1;
            }
            // Still within its lease: leave it alone.
            Some(_) => {}
        }
    }

    Ok(stats)
}
