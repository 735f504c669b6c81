//! Store contract for the quota ledger.
//!
//! The durable store is an external collaborator; this crate pins down the
//! exact surface the ledger needs from it and ships [`MemoryStore`], a
//! deterministic in-memory backend used by the daemon default wiring and by
//! every test in the workspace.
//!
//! The contract has two layers:
//! - plain record access (fetch/create/list), where staleness is acceptable
//!   because the ledger never acts on those reads without re-verifying;
//! - **named atomic transitions** ([`QuotaStore::bind_device`],
//!   [`QuotaStore::reserve_unit`], [`QuotaStore::commit_reservation`],
//!   [`QuotaStore::cancel_reservation`], [`QuotaStore::reclaim_lost`]),
//!   each of which must execute as one indivisible read-check-write against
//!   the backend. Concurrent callers may never observe an intermediate
//!   state of a transition. A scripted store (Lua, CAS, serialized command
//!   execution) implements each transition as one script; `MemoryStore`
//!   implements each as one critical section.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qk_schemas::{CodeRecord, CodeStatus, ReservationRecord};
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

/// Backend failure. Surfaced to the caller as an internal error; never
/// masked, since degrading silently risks quota-consistency violations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Transition outcomes
// ---------------------------------------------------------------------------

/// Outcome of the binding check-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The code is now bound to the caller's token (either this call set it,
    /// or it was already bound to the same token).
    Bound,
    /// A different token won the binding.
    Mismatch,
}

/// Outcome of the increment-and-threshold spend transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// One unit reserved; `remaining` is the post-increment headroom.
    Reserved { remaining: u32 },
    /// Code status was not `active` at transition time.
    NotActive,
    /// `used` already reached `quota_total`; the transition flipped the code
    /// to `exhausted` as a side effect.
    Exhausted,
}

/// Outcome of the commit transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    AlreadyCommitted,
    AlreadyCanceled,
    /// The reservation key no longer exists (lease TTL fired).
    Vanished,
}

/// Outcome of the cancel/rollback transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Rolled back: state set to canceled, `used` decremented, pending entry
    /// dropped, `exhausted` reverted to `active` where applicable.
    Canceled,
    /// The reservation had already settled; only the pending index entry was
    /// cleaned up. No quota effect.
    NotReserved,
    /// The reservation key no longer exists (lease TTL fired).
    Vanished,
}

/// Snapshot of a fixed-window counter after a bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSample {
    /// Count including this bump.
    pub count: u64,
    /// Remaining lifetime of the window key.
    pub ttl: Duration,
}

// ---------------------------------------------------------------------------
// QuotaStore
// ---------------------------------------------------------------------------

/// Surface the ledger requires from the collaborator key-value store.
///
/// Transitions that touch a code record are keyed by the code alone, so
/// operations on different codes are fully independent; serialization
/// happens only at the granularity of each transition.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    // ---- code records ----

    /// Create a code record, first writer wins. Returns `false` (and writes
    /// nothing) if the code already exists.
    async fn create_code(&self, code: &str, record: &CodeRecord) -> StoreResult<bool>;

    async fn code_exists(&self, code: &str) -> StoreResult<bool>;

    async fn fetch_code(&self, code: &str) -> StoreResult<Option<CodeRecord>>;

    /// Full registry of minted codes, for administrative enumeration.
    async fn list_codes(&self) -> StoreResult<Vec<String>>;

    /// Unconditional status write (revocation). No quota effect.
    async fn set_status(&self, code: &str, status: CodeStatus) -> StoreResult<()>;

    /// Clear the device binding and stamp the reset. Returns the incremented
    /// reset count. `used` is untouched.
    async fn clear_binding(&self, code: &str, at: DateTime<Utc>) -> StoreResult<u32>;

    // ---- atomic transitions ----

    /// Check-and-set the device binding: only writes the token if the
    /// binding is still unset. Exactly one of N concurrent callers with
    /// distinct tokens observes [`BindOutcome::Bound`].
    async fn bind_device(&self, code: &str, device_hash: &str) -> StoreResult<BindOutcome>;

    /// Spend one unit: gate on `status == active`, then increment `used`
    /// and flip to `exhausted` when the threshold is reached, all in one
    /// step. Two concurrent callers can never both see `used == total - 1`.
    async fn reserve_unit(&self, code: &str) -> StoreResult<ReserveOutcome>;

    /// Settle a reservation as committed: verify it is still `reserved`,
    /// mark it, and drop it from the pending index in one step (a reconciler
    /// sweep may race to expire it).
    async fn commit_reservation(&self, reservation_id: &str, code: &str)
        -> StoreResult<CommitOutcome>;

    /// Roll back a reservation: verify still `reserved`, mark canceled,
    /// drop from pending, decrement `used`, revert `exhausted` to `active`.
    /// One step; shared by explicit cancel and proactive lease expiry.
    async fn cancel_reservation(&self, reservation_id: &str, code: &str)
        -> StoreResult<CancelOutcome>;

    /// Reclaim a reservation whose key vanished (lease TTL fired before a
    /// settle). The pending-set removal guards the decrement: removing a
    /// non-member is a no-op that short-circuits the rollback, which makes
    /// the reclaim idempotent under concurrent sweeps. Returns whether the
    /// rollback fired.
    async fn reclaim_lost(&self, code: &str, reservation_id: &str) -> StoreResult<bool>;

    // ---- reservations + pending index ----

    /// Persist a reservation with a store-enforced key TTL equal to the
    /// lease, and add it to the code's pending index.
    async fn create_reservation(
        &self,
        reservation_id: &str,
        record: &ReservationRecord,
        ttl: Duration,
    ) -> StoreResult<()>;

    async fn fetch_reservation(&self, reservation_id: &str)
        -> StoreResult<Option<ReservationRecord>>;

    /// Reservation ids currently believed live for this code. An index, not
    /// a source of truth: entries may lag the reservation records.
    async fn pending_reservations(&self, code: &str) -> StoreResult<Vec<String>>;

    /// Drop an id from the pending index (cheap cleanup for settled
    /// reservations spotted by a sweep).
    async fn remove_pending(&self, code: &str, reservation_id: &str) -> StoreResult<()>;

    // ---- per-code audit log ----

    /// Push one encoded entry onto the code's append-only log.
    async fn append_log(&self, code: &str, line: &str) -> StoreResult<()>;

    /// Most recent `limit` log lines, newest first.
    async fn read_log(&self, code: &str, limit: usize) -> StoreResult<Vec<String>>;

    // ---- fixed-window counters ----

    /// Increment a window counter; the first bump in a window arms its
    /// expiry. Returns the post-bump count and the window's remaining TTL.
    async fn bump_counter(&self, key: &str, window: Duration) -> StoreResult<CounterSample>;
}
