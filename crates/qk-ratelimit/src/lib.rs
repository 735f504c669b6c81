//! Fixed-window admission control in front of the ledger.
//!
//! Counters are keyed by `(scope, window-bucket)` where the bucket is wall
//! time divided by the window length, so all replicas agree on the bucket
//! without coordination. The first bump in a bucket arms the key's expiry;
//! a denial carries a retry-after derived from the window key's remaining
//! TTL. IP and code ceilings are independent; either one failing blocks the
//! call before it reaches the ledger.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use qk_store::{QuotaStore, StoreResult};

/// Window length and per-scope ceilings. Tests shrink the window to cross
/// bucket boundaries quickly.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    /// Ceiling per caller IP per window.
    pub ip_limit: u64,
    /// Ceiling per code per window.
    pub code_limit: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            ip_limit: 60,
            code_limit: 20,
        }
    }
}

/// Admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Ceiling exceeded; `retry_after` is the remaining life of the window.
    Limited { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Allowed => None,
            Admission::Limited { retry_after } => Some(*retry_after),
        }
    }
}

/// Fixed-window rate limiter over the store's counter surface. Independent
/// of the ledger; consulted before any ledger operation.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn QuotaStore>,
    cfg: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self::with_config(store, RateLimitConfig::default())
    }

    pub fn with_config(store: Arc<dyn QuotaStore>, cfg: RateLimitConfig) -> Self {
        Self { store, cfg }
    }

    /// Combined check, IP first. `code` is included when the request names
    /// one (post-normalization, so canonical and contiguous forms share a
    /// counter).
    pub async fn check(&self, ip: &str, code: Option<&str>) -> StoreResult<Admission> {
        let by_ip = self.check_ip(ip).await?;
        if !by_ip.is_allowed() {
            return Ok(by_ip);
        }
        match code {
            Some(code) => self.check_code(code).await,
            None => Ok(by_ip),
        }
    }

    pub async fn check_ip(&self, ip: &str) -> StoreResult<Admission> {
        let key = format!("ratelimit:ip:{ip}:{}", self.bucket());
        self.check_key(&key, self.cfg.ip_limit).await
    }

    pub async fn check_code(&self, code: &str) -> StoreResult<Admission> {
        let key = format!("ratelimit:code:{code}:{}", self.bucket());
        self.check_key(&key, self.cfg.code_limit).await
    }

    async fn check_key(&self, key: &str, limit: u64) -> StoreResult<Admission> {
        let sample = self.store.bump_counter(key, self.cfg.window).await?;
        if sample.count > limit {
            let retry_after = if sample.ttl.is_zero() {
                self.cfg.window
            } else {
                sample.ttl
            };
            return Ok(Admission::Limited { retry_after });
        }
        Ok(Admission::Allowed)
    }

    /// Discrete, non-overlapping time bucket for the current window.
    fn bucket(&self) -> u128 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        now_ms / self.cfg.window.as_millis().max(1)
    }
}
