//! Deterministic in-memory store backend.
//!
//! One mutex around the whole keyspace stands in for the scripted-transaction
//! atomicity a production store provides per key: every trait method is a
//! single critical section, so no caller ever observes an intermediate state
//! of a transition. Lease TTLs and counter windows are emulated by stamping a
//! monotonic deadline on each entry and purging lapsed entries at the top of
//! every critical section — from the outside, an expired reservation key has
//! simply vanished, exactly like a store-fired expiry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qk_schemas::{CodeRecord, CodeStatus, ReservationRecord, ReservationState};

use crate::{
    BindOutcome, CancelOutcome, CommitOutcome, CounterSample, QuotaStore, ReserveOutcome,
    StoreError, StoreResult,
};

#[derive(Debug, Clone)]
struct StoredReservation {
    record: ReservationRecord,
    /// Emulated key TTL; the entry is dropped once this passes.
    purge_at: Instant,
}

#[derive(Debug, Clone)]
struct CounterWindow {
    count: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    codes: BTreeMap<String, CodeRecord>,
    reservations: BTreeMap<String, StoredReservation>,
    /// code -> reservation ids believed live (the pending index).
    pending: BTreeMap<String, BTreeSet<String>>,
    /// code -> encoded audit lines, oldest first.
    logs: BTreeMap<String, Vec<String>>,
    counters: BTreeMap<String, CounterWindow>,
}

impl Inner {
    /// Drop reservation keys and counter windows whose deadline passed.
    fn purge(&mut self, now: Instant) {
        self.reservations.retain(|_, r| r.purge_at > now);
        self.counters.retain(|_, c| c.expires_at > now);
    }

    /// Shared rollback arm: decrement `used` and revert exhausted -> active.
    /// Never resurrects a revoked code.
    fn roll_back_unit(&mut self, code: &str) {
        if let Some(rec) = self.codes.get_mut(code) {
            if rec.used > 0 {
                rec.used -= 1;
                if rec.status == CodeStatus::Exhausted {
                    rec.status = CodeStatus::Active;
                }
            }
        }
    }
}

/// In-memory [`QuotaStore`] backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store mutex poisoned".to_string()))?;
        guard.purge(Instant::now());
        Ok(guard)
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    // ---- code records ----

    async fn create_code(&self, code: &str, record: &CodeRecord) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        if inner.codes.contains_key(code) {
            return Ok(false);
        }
        inner.codes.insert(code.to_string(), record.clone());
        Ok(true)
    }

    async fn code_exists(&self, code: &str) -> StoreResult<bool> {
        Ok(self.lock()?.codes.contains_key(code))
    }

    async fn fetch_code(&self, code: &str) -> StoreResult<Option<CodeRecord>> {
        Ok(self.lock()?.codes.get(code).cloned())
    }

    async fn list_codes(&self) -> StoreResult<Vec<String>> {
        Ok(self.lock()?.codes.keys().cloned().collect())
    }

    async fn set_status(&self, code: &str, status: CodeStatus) -> StoreResult<()> {
        let mut inner = self.lock()?;
        match inner.codes.get_mut(code) {
            Some(rec) => {
                rec.status = status;
                Ok(())
            }
            None => Err(StoreError::Backend(format!("set_status on unknown code {code}"))),
        }
    }

    async fn clear_binding(&self, code: &str, at: DateTime<Utc>) -> StoreResult<u32> {
        let mut inner = self.lock()?;
        match inner.codes.get_mut(code) {
            Some(rec) => {
                rec.bound_device_hash = None;
                rec.bind_reset_count += 1;
                rec.bind_reset_at = Some(at);
                Ok(rec.bind_reset_count)
            }
            None => Err(StoreError::Backend(format!(
                "clear_binding on unknown code {code}"
            ))),
        }
    }

    // ---- atomic transitions ----

    async fn bind_device(&self, code: &str, device_hash: &str) -> StoreResult<BindOutcome> {
        let mut inner = self.lock()?;
        let rec = inner
            .codes
            .get_mut(code)
            .ok_or_else(|| StoreError::Backend(format!("bind_device on unknown code {code}")))?;
        match rec.bound_device_hash.as_deref() {
            Some(current) if current != device_hash => Ok(BindOutcome::Mismatch),
            Some(_) => Ok(BindOutcome::Bound),
            None => {
                rec.bound_device_hash = Some(device_hash.to_string());
                Ok(BindOutcome::Bound)
            }
        }
    }

    async fn reserve_unit(&self, code: &str) -> StoreResult<ReserveOutcome> {
        let mut inner = self.lock()?;
        let rec = inner
            .codes
            .get_mut(code)
            .ok_or_else(|| StoreError::Backend(format!("reserve_unit on unknown code {code}")))?;

        if rec.status != CodeStatus::Active {
            return Ok(ReserveOutcome::NotActive);
        }
        if rec.used >= rec.quota_total {
            rec.status = CodeStatus::Exhausted;
            return Ok(ReserveOutcome::Exhausted);
        }

        rec.used += 1;
        if rec.used >= rec.quota_total {
            rec.status = CodeStatus::Exhausted;
        }
        Ok(ReserveOutcome::Reserved {
            remaining: rec.quota_total - rec.used,
        })
    }

    async fn commit_reservation(
        &self,
        reservation_id: &str,
        code: &str,
    ) -> StoreResult<CommitOutcome> {
        let mut inner = self.lock()?;
        let state = match inner.reservations.get(reservation_id) {
            None => return Ok(CommitOutcome::Vanished),
            Some(stored) => stored.record.state,
        };
        match state {
            ReservationState::Committed => Ok(CommitOutcome::AlreadyCommitted),
            ReservationState::Canceled => Ok(CommitOutcome::AlreadyCanceled),
            ReservationState::Reserved => {
                if let Some(stored) = inner.reservations.get_mut(reservation_id) {
                    stored.record.state = ReservationState::Committed;
                }
                if let Some(set) = inner.pending.get_mut(code) {
                    set.remove(reservation_id);
                }
                Ok(CommitOutcome::Committed)
            }
        }
    }

    async fn cancel_reservation(
        &self,
        reservation_id: &str,
        code: &str,
    ) -> StoreResult<CancelOutcome> {
        let mut inner = self.lock()?;
        let state = match inner.reservations.get(reservation_id) {
            None => return Ok(CancelOutcome::Vanished),
            Some(stored) => stored.record.state,
        };
        if state != ReservationState::Reserved {
            // Already settled: only the index entry needs cleanup.
            if let Some(set) = inner.pending.get_mut(code) {
                set.remove(reservation_id);
            }
            return Ok(CancelOutcome::NotReserved);
        }

        if let Some(stored) = inner.reservations.get_mut(reservation_id) {
            stored.record.state = ReservationState::Canceled;
        }
        if let Some(set) = inner.pending.get_mut(code) {
            set.remove(reservation_id);
        }
        inner.roll_back_unit(code);
        Ok(CancelOutcome::Canceled)
    }

    async fn reclaim_lost(&self, code: &str, reservation_id: &str) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let removed = inner
            .pending
            .get_mut(code)
            .map(|set| set.remove(reservation_id))
            .unwrap_or(false);
        if removed {
            inner.roll_back_unit(code);
        }
        Ok(removed)
    }

    // ---- reservations + pending index ----

    async fn create_reservation(
        &self,
        reservation_id: &str,
        record: &ReservationRecord,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.reservations.insert(
            reservation_id.to_string(),
            StoredReservation {
                record: record.clone(),
                purge_at: Instant::now() + ttl,
            },
        );
        inner
            .pending
            .entry(record.code.clone())
            .or_default()
            .insert(reservation_id.to_string());
        Ok(())
    }

    async fn fetch_reservation(
        &self,
        reservation_id: &str,
    ) -> StoreResult<Option<ReservationRecord>> {
        Ok(self
            .lock()?
            .reservations
            .get(reservation_id)
            .map(|s| s.record.clone()))
    }

    async fn pending_reservations(&self, code: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .pending
            .get(code)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_pending(&self, code: &str, reservation_id: &str) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if let Some(set) = inner.pending.get_mut(code) {
            set.remove(reservation_id);
        }
        Ok(())
    }

    // ---- per-code audit log ----

    async fn append_log(&self, code: &str, line: &str) -> StoreResult<()> {
        self.lock()?
            .logs
            .entry(code.to_string())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn read_log(&self, code: &str, limit: usize) -> StoreResult<Vec<String>> {
        Ok(self
            .lock()?
            .logs
            .get(code)
            .map(|lines| lines.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    // ---- fixed-window counters ----

    async fn bump_counter(&self, key: &str, window: Duration) -> StoreResult<CounterSample> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        let entry = inner
            .counters
            .entry(key.to_string())
            .or_insert(CounterWindow {
                count: 0,
                expires_at: now + window,
            });
        entry.count += 1;
        let ttl = entry.expires_at.saturating_duration_since(now);
        Ok(CounterSample {
            count: entry.count,
            ttl,
        })
    }
}
