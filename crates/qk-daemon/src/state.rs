//! Shared runtime state for qk-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. All cross-request
//! coordination lives in the injected store; `AppState` itself is plain
//! wiring plus static configuration read once at boot.

use std::sync::Arc;

use qk_ledger::{Ledger, LedgerConfig};
use qk_ratelimit::{RateLimitConfig, RateLimiter};
use qk_store::QuotaStore;
use serde::{Deserialize, Serialize};

pub const ENV_ADMIN_SECRET: &str = "QK_ADMIN_SECRET";
pub const ENV_BASE_URL: &str = "QK_BASE_URL";

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub limits: RateLimiter,
    /// Shared admin secret checked against the `x-admin-secret` header.
    /// `None` = not configured; admin routes refuse with 500 rather than
    /// falling open.
    pub admin_secret: Option<String>,
    /// Base URL used to render holder-facing redeem links.
    pub base_url: String,
    pub build: BuildInfo,
}

impl AppState {
    /// Wire the state around an injected store (the process-scoped store
    /// client; see `main.rs`). Ledger and limiter tunables are explicit so
    /// tests can shrink leases and windows.
    pub fn new(
        store: Arc<dyn QuotaStore>,
        ledger_cfg: LedgerConfig,
        limit_cfg: RateLimitConfig,
        admin_secret: Option<String>,
        base_url: String,
    ) -> Self {
        Self {
            ledger: Ledger::with_config(Arc::clone(&store), ledger_cfg),
            limits: RateLimiter::with_config(store, limit_cfg),
            admin_secret,
            base_url,
            build: BuildInfo {
                service: "qk-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }

    /// Production wiring: defaults plus `QK_ADMIN_SECRET` / `QK_BASE_URL`.
    pub fn from_env(store: Arc<dyn QuotaStore>) -> Self {
        let admin_secret = std::env::var(ENV_ADMIN_SECRET).ok().filter(|s| !s.is_empty());
        let base_url = std::env::var(ENV_BASE_URL)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "http://localhost:8977".to_string());
        Self::new(
            store,
            LedgerConfig::default(),
            RateLimitConfig::default(),
            admin_secret,
            base_url,
        )
    }
}
