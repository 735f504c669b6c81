//! Redemption-code minting, normalization, and device identity hashing.
//!
//! Pure leaf utilities consumed by the ledger. Minting is the only function
//! here that talks to the store (for the uniqueness check); everything else
//! is deterministic and side-effect free.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use qk_store::{QuotaStore, StoreError};

/// Code alphabet: 32 symbols, no `0/O/1/I` to avoid transcription mistakes.
/// Exactly 32 entries so a random byte maps uniformly via `% 32`.
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Raw symbol count of a code (rendered as two dash-separated groups of 4).
const CODE_LEN: usize = 8;

/// Collision-retry ceiling. Bounds minting latency when the store is dense;
/// at 32^8 possible codes this fires only under store malfunction.
const MAX_MINT_ATTEMPTS: usize = 10;

#[derive(Debug, Error)]
pub enum MintError {
    /// No unused code found within the attempt budget.
    #[error("failed to mint a unique code after {MAX_MINT_ATTEMPTS} attempts")]
    GenerationExhausted,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mint a fresh `XXXX-XXXX` code, collision-checked against the store.
pub async fn mint(store: &dyn QuotaStore) -> Result<String, MintError> {
    for _ in 0..MAX_MINT_ATTEMPTS {
        let candidate = random_code();
        if !store.code_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(MintError::GenerationExhausted)
}

fn random_code() -> String {
    let mut bytes = [0u8; CODE_LEN];
    OsRng.fill_bytes(&mut bytes);
    let mut out = String::with_capacity(CODE_LEN + 1);
    for (i, b) in bytes.iter().enumerate() {
        if i == CODE_LEN / 2 {
            out.push('-');
        }
        out.push(ALPHABET[(*b as usize) % ALPHABET.len()] as char);
    }
    out
}

/// Normalize user-entered input toward canonical `XXXX-XXXX` form: trim,
/// strip inner whitespace, uppercase, and insert the dash only when the
/// cleaned input is exactly 8 contiguous symbols. This is a parsing
/// convenience, not a validator — malformed input passes through unchanged
/// and simply fails lookup downstream.
pub fn normalize(input: &str) -> String {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    // The dash insert slices by byte index, so it only applies to input
    // that is entirely code-alphabet shaped (ASCII). Anything else is
    // malformed and passes through as-is.
    if cleaned.is_ascii() && cleaned.len() == CODE_LEN && !cleaned.contains('-') {
        format!("{}-{}", &cleaned[..4], &cleaned[4..])
    } else {
        cleaned
    }
}

/// Mask a code for listings: `ABCD-EFGH` -> `ABCD-****`.
pub fn mask(code: &str) -> String {
    match code.split_once('-') {
        Some((head, _)) => format!("{head}-****"),
        None => {
            let head: String = code.chars().take(4).collect();
            format!("{head}****")
        }
    }
}

/// One-way transform of a client-supplied device identifier into the opaque
/// binding token: SHA-256, lowercase hex. No salt, so the same identifier
/// produces the same token across process restarts. The raw identifier is
/// never stored.
pub fn device_hash(device_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qk_store::MemoryStore;

    #[test]
    fn normalize_accepts_both_canonical_and_contiguous() {
        assert_eq!(normalize(" abcd-efgh "), "ABCD-EFGH");
        assert_eq!(normalize("ABCDEFGH"), "ABCD-EFGH");
        assert_eq!(normalize("ab cd ef gh"), "ABCD-EFGH");
    }

    #[test]
    fn normalize_passes_malformed_input_through() {
        assert_eq!(normalize("abc"), "ABC");
        assert_eq!(normalize("ABCD-EFGH-IJKL"), "ABCD-EFGH-IJKL");
        assert_eq!(normalize("ABCDEFGHI"), "ABCDEFGHI");
    }

    #[test]
    fn normalize_passes_non_ascii_input_through_unchanged() {
        // 8 bytes but not 8 ASCII symbols: byte 4 sits inside a char, so
        // the dash insert must not fire.
        assert_eq!(normalize("ab\u{263A}\u{263A}"), "AB\u{263A}\u{263A}");
        assert_eq!(normalize("ключ"), "КЛЮЧ");
        assert_eq!(normalize(" абвгдежз "), "АБВГДЕЖЗ");
    }

    #[test]
    fn minted_codes_use_the_restricted_alphabet() {
        for _ in 0..32 {
            let code = random_code();
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            for c in code.chars().filter(|c| *c != '-') {
                assert!(
                    ALPHABET.contains(&(c as u8)),
                    "unexpected symbol {c:?} in {code}"
                );
                assert!(!"0O1I".contains(c));
            }
        }
    }

    #[test]
    fn device_hash_is_deterministic_hex() {
        let a = device_hash("device-123");
        let b = device_hash("device-123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, device_hash("device-124"));
    }

    #[test]
    fn mask_hides_second_group() {
        assert_eq!(mask("ABCD-EFGH"), "ABCD-****");
        assert_eq!(mask("ABCDEFGH"), "ABCD****");
        assert_eq!(mask("AB"), "AB****");
        // Dashless multibyte input truncates by character, not byte.
        assert_eq!(mask("КЛЮЧКЛЮЧ"), "КЛЮЧ****");
    }

    #[tokio::test]
    async fn mint_avoids_existing_codes() {
        let store = MemoryStore::new();
        let code = mint(&store).await.unwrap();
        assert_eq!(code.len(), 9);
        // Register it and mint again: must come back different.
        let rec = qk_schemas::CodeRecord::new(1, None, chrono::Utc::now());
        store.create_code(&code, &rec).await.unwrap();
        let other = mint(&store).await.unwrap();
        assert_ne!(code, other);
    }

    /// Store double whose uniqueness check always reports a collision.
    struct AlwaysTaken;

    #[async_trait]
    impl QuotaStore for AlwaysTaken {
        async fn create_code(
            &self,
            _: &str,
            _: &qk_schemas::CodeRecord,
        ) -> qk_store::StoreResult<bool> {
            Ok(false)
        }
        async fn code_exists(&self, _: &str) -> qk_store::StoreResult<bool> {
            Ok(true)
        }
        async fn fetch_code(
            &self,
            _: &str,
        ) -> qk_store::StoreResult<Option<qk_schemas::CodeRecord>> {
            Ok(None)
        }
        async fn list_codes(&self) -> qk_store::StoreResult<Vec<String>> {
            Ok(vec![])
        }
        async fn set_status(
            &self,
            _: &str,
            _: qk_schemas::CodeStatus,
        ) -> qk_store::StoreResult<()> {
            Ok(())
        }
        async fn clear_binding(
            &self,
            _: &str,
            _: chrono::DateTime<chrono::Utc>,
        ) -> qk_store::StoreResult<u32> {
            Ok(0)
        }
        async fn bind_device(
            &self,
            _: &str,
            _: &str,
        ) -> qk_store::StoreResult<qk_store::BindOutcome> {
            Ok(qk_store::BindOutcome::Bound)
        }
        async fn reserve_unit(&self, _: &str) -> qk_store::StoreResult<qk_store::ReserveOutcome> {
            Ok(qk_store::ReserveOutcome::NotActive)
        }
        async fn commit_reservation(
            &self,
            _: &str,
            _: &str,
        ) -> qk_store::StoreResult<qk_store::CommitOutcome> {
            Ok(qk_store::CommitOutcome::Vanished)
        }
        async fn cancel_reservation(
            &self,
            _: &str,
            _: &str,
        ) -> qk_store::StoreResult<qk_store::CancelOutcome> {
            Ok(qk_store::CancelOutcome::Vanished)
        }
        async fn reclaim_lost(&self, _: &str, _: &str) -> qk_store::StoreResult<bool> {
            Ok(false)
        }
        async fn create_reservation(
            &self,
            _: &str,
            _: &qk_schemas::ReservationRecord,
            _: std::time::Duration,
        ) -> qk_store::StoreResult<()> {
            Ok(())
        }
        async fn fetch_reservation(
            &self,
            _: &str,
        ) -> qk_store::StoreResult<Option<qk_schemas::ReservationRecord>> {
            Ok(None)
        }
        async fn pending_reservations(&self, _: &str) -> qk_store::StoreResult<Vec<String>> {
            Ok(vec![])
        }
        async fn remove_pending(&self, _: &str, _: &str) -> qk_store::StoreResult<()> {
            Ok(())
        }
        async fn append_log(&self, _: &str, _: &str) -> qk_store::StoreResult<()> {
            Ok(())
        }
        async fn read_log(&self, _: &str, _: usize) -> qk_store::StoreResult<Vec<String>> {
            Ok(vec![])
        }
        async fn bump_counter(
            &self,
            _: &str,
            _: std::time::Duration,
        ) -> qk_store::StoreResult<qk_store::CounterSample> {
            Ok(qk_store::CounterSample {
                count: 0,
                ttl: std::time::Duration::ZERO,
            })
        }
    }

    #[tokio::test]
    async fn mint_gives_up_after_bounded_attempts() {
        let err = mint(&AlwaysTaken).await.unwrap_err();
        assert!(matches!(err, MintError::GenerationExhausted));
    }
}
