//! Shared helpers for the cross-crate scenario tests under `tests/`.
//!
//! Everything here wires real crates together over a fresh in-memory store;
//! nothing is mocked. Scenario tests shrink lease TTLs through
//! `fast_ledger` instead of mocking time.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use qk_audit::AuditOutcome;
use qk_ledger::{Ledger, LedgerConfig};
use qk_schemas::ReservationState;
use qk_store::{MemoryStore, QuotaStore};

/// Fresh ledger + store pair with production defaults.
pub fn fresh_ledger() -> (Ledger, Arc<dyn QuotaStore>) {
    ledger_with(LedgerConfig::default())
}

/// Fresh ledger with a shortened reservation lease, for expiry scenarios.
pub fn fast_ledger(reservation_ttl: Duration) -> (Ledger, Arc<dyn QuotaStore>) {
    ledger_with(LedgerConfig {
        reservation_ttl,
        ..LedgerConfig::default()
    })
}

fn ledger_with(cfg: LedgerConfig) -> (Ledger, Arc<dyn QuotaStore>) {
    let store: Arc<dyn QuotaStore> = Arc::new(MemoryStore::new());
    (Ledger::with_config(Arc::clone(&store), cfg), store)
}

/// Mint a code and bind it to `device_id`, returning the normalized code.
pub async fn minted_bound_code(ledger: &Ledger, quota: u32, device_id: &str) -> Result<String> {
    let minted = ledger
        .activate(quota, None)
        .await
        .context("activate code")?;
    ledger
        .redeem(&minted.code, device_id)
        .await
        .context("bind device")?;
    Ok(minted.code)
}

/// Conservation invariant: at a quiescent point, `used` equals the number
/// of committed settlements plus the reservations still inside their lease.
pub async fn assert_conserved(ledger: &Ledger, code: &str) -> Result<()> {
    let store = ledger.store();
    let record = store
        .fetch_code(code)
        .await?
        .context("code record missing")?;

    let committed = qk_audit::read_recent(store.as_ref(), code, 10_000)
        .await?
        .iter()
        .filter(|e| e.outcome == AuditOutcome::Committed)
        .count() as u32;

    let now = Utc::now();
    let mut live = 0u32;
    for rid in store.pending_reservations(code).await? {
        if let Some(resv) = store.fetch_reservation(&rid).await? {
            if resv.state == ReservationState::Reserved && resv.expires_at > now {
                live += 1;
            }
        }
    }

    anyhow::ensure!(
        record.used == committed + live,
        "conservation violated: used={} committed={} live={}",
        record.used,
        committed,
        live
    );
    Ok(())
}
