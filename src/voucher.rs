//! Password-encrypted claim vouchers
//!
//! A voucher lets an email recipient claim without an OTP round-trip: the
//! claim credentials {identifier, leaf index} are sealed under a password
//! chosen at registration time. AES-256-GCM for encryption, Argon2id for key
//! derivation, unique salt and nonce per voucher. The password is the sole
//! authentication factor, so redemption failures are throttled per source
//! address and an unknown code is indistinguishable from a wrong password.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{RelayerError, RelayerResult};

/// Argon2 parameters for key derivation.
const ARGON2_M_COST: u32 = 65536; // 64 MB memory
const ARGON2_T_COST: u32 = 3; // 3 iterations
const ARGON2_P_COST: u32 = 4; // 4 parallel lanes

/// Visually unambiguous alphabet: no 0/O, 1/I.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LEN: usize = 12;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Redemption throttle: failures per source address in a sliding window.
const MAX_FAILURES: usize = 5;
const FAILURE_WINDOW: Duration = Duration::from_secs(15 * 60);

const VOUCHERS_FILE: &str = "vouchers.json";

/// Persisted voucher row. Carries no secret material in the clear.
#[derive(Serialize, Deserialize, Clone)]
pub struct VoucherRow {
    pub code: String,
    pub pool: String,
    pub amount: u64,
    pub token: String,
    pub ciphertext: String,
    pub salt: String,
    pub nonce: String,
    pub created_at: String,
    pub claimed: bool,
}

/// The sealed payload.
#[derive(Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
struct VoucherSecret {
    identifier: String,
    leaf_index: u32,
}

/// Claim credentials returned by a successful redemption.
#[derive(Debug)]
pub struct RedeemedVoucher {
    pub identifier: String,
    pub leaf_index: u32,
    pub pool: String,
    pub amount: u64,
    pub token: String,
}

/// Public voucher status for `GET /vouchers/:code`.
pub struct VoucherStatus {
    pub code: String,
    pub amount: u64,
    pub token: String,
    pub claimed: bool,
}

pub struct VoucherStore {
    path: PathBuf,
    rows: Mutex<HashMap<String, VoucherRow>>,
}

impl VoucherStore {
    pub fn open(data_dir: &std::path::Path) -> RelayerResult<Self> {
        let path = data_dir.join(VOUCHERS_FILE);
        let rows = if path.exists() {
            let json = fs::read_to_string(&path)
                .map_err(|e| RelayerError::Internal(format!("failed to read voucher table: {e}")))?;
            serde_json::from_str(&json)
                .map_err(|e| RelayerError::Internal(format!("corrupt voucher table: {e}")))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    fn persist(&self, rows: &HashMap<String, VoucherRow>) -> RelayerResult<()> {
        let json = serde_json::to_string_pretty(rows)
            .map_err(|e| RelayerError::Internal(format!("voucher serialization failed: {e}")))?;
        fs::write(&self.path, &json)
            .map_err(|e| RelayerError::Internal(format!("failed to write voucher table: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    /// Create a voucher: random code, fresh salt and nonce, credentials
    /// sealed under the password. Returns the code.
    pub fn create(
        &self,
        identifier: &str,
        leaf_index: u32,
        password: &str,
        pool: &str,
        amount: u64,
        token: &str,
    ) -> RelayerResult<String> {
        let code = generate_code();

        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let mut key = derive_key(password, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| RelayerError::Internal(format!("cipher creation failed: {e}")))?;
        key.zeroize();

        let secret = VoucherSecret {
            identifier: identifier.to_string(),
            leaf_index,
        };
        let plaintext = serde_json::to_vec(&secret)
            .map_err(|e| RelayerError::Internal(format!("voucher payload failed: {e}")))?;

        let nonce = Nonce::from(nonce_bytes);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| RelayerError::Internal(format!("voucher encryption failed: {e}")))?;

        let row = VoucherRow {
            code: code.clone(),
            pool: pool.to_string(),
            amount,
            token: token.to_string(),
            ciphertext: BASE64.encode(&ciphertext),
            salt: BASE64.encode(salt),
            nonce: BASE64.encode(nonce_bytes),
            created_at: chrono::Utc::now().to_rfc3339(),
            claimed: false,
        };

        let mut rows = self.rows.lock().unwrap();
        rows.insert(code.clone(), row);
        self.persist(&rows)?;
        Ok(code)
    }

    /// Redeem a voucher. A wrong password and a nonexistent code return the
    /// same generic error, after a randomized small delay.
    pub fn redeem(&self, code: &str, password: &str) -> RelayerResult<RedeemedVoucher> {
        let row = {
            let rows = self.rows.lock().unwrap();
            rows.get(&normalize_code(code)).cloned()
        };

        let Some(row) = row else {
            jittered_delay();
            return Err(RelayerError::VoucherInvalid);
        };
        if row.claimed {
            return Err(RelayerError::VoucherAlreadyUsed);
        }

        let salt = BASE64
            .decode(&row.salt)
            .map_err(|_| RelayerError::Internal("corrupt voucher salt".to_string()))?;
        let nonce_bytes: [u8; NONCE_LEN] = BASE64
            .decode(&row.nonce)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| RelayerError::Internal("corrupt voucher nonce".to_string()))?;
        let ciphertext = BASE64
            .decode(&row.ciphertext)
            .map_err(|_| RelayerError::Internal("corrupt voucher ciphertext".to_string()))?;

        let mut key = derive_key(password, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| RelayerError::Internal(format!("cipher creation failed: {e}")))?;
        key.zeroize();

        let nonce = Nonce::from(nonce_bytes);
        let plaintext = match cipher.decrypt(&nonce, ciphertext.as_ref()) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                // Wrong password. Same shape as an unknown code.
                jittered_delay();
                return Err(RelayerError::VoucherInvalid);
            }
        };

        let secret: VoucherSecret = serde_json::from_slice(&plaintext)
            .map_err(|_| RelayerError::Internal("corrupt voucher payload".to_string()))?;

        Ok(RedeemedVoucher {
            identifier: secret.identifier.clone(),
            leaf_index: secret.leaf_index,
            pool: row.pool,
            amount: row.amount,
            token: row.token,
        })
    }

    /// Flip `claimed`, gated behind a fresh successful redeem with the same
    /// password so an unauthenticated caller cannot invalidate a voucher.
    /// Idempotent once claimed.
    pub fn mark_claimed(&self, code: &str, password: &str) -> RelayerResult<()> {
        let code = normalize_code(code);
        match self.redeem(&code, password) {
            Ok(_) => {}
            Err(RelayerError::VoucherAlreadyUsed) => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&code) {
            row.claimed = true;
        }
        self.persist(&rows)
    }

    /// Public, secret-free status lookup.
    pub fn status(&self, code: &str) -> RelayerResult<VoucherStatus> {
        let rows = self.rows.lock().unwrap();
        let row = rows
            .get(&normalize_code(code))
            .ok_or_else(|| RelayerError::NotFound("voucher".to_string()))?;
        Ok(VoucherStatus {
            code: row.code.clone(),
            amount: row.amount,
            token: row.token.clone(),
            claimed: row.claimed,
        })
    }

    /// Purge claimed rows older than the retention window. Returns the
    /// number of rows removed.
    pub fn cleanup(&self, days_old: i64) -> RelayerResult<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days_old);
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, row| {
            if !row.claimed {
                return true;
            }
            match chrono::DateTime::parse_from_rfc3339(&row.created_at) {
                Ok(created) => created > cutoff,
                // Unparseable timestamp: keep the row, never silently drop.
                Err(_) => true,
            }
        });
        let removed = before - rows.len();
        if removed > 0 {
            self.persist(&rows)?;
        }
        Ok(removed)
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn derive_key(password: &str, salt: &[u8]) -> RelayerResult<[u8; 32]> {
    let argon2 = Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, Some(32))
            .map_err(|e| RelayerError::Internal(format!("argon2 params error: {e}")))?,
    );
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| RelayerError::Internal(format!("key derivation failed: {e}")))?;
    Ok(key)
}

/// Small randomized sleep on failure paths, blunting timing side-channels
/// between "no such code" and "wrong password".
fn jittered_delay() {
    let millis = rand::thread_rng().gen_range(50..200);
    std::thread::sleep(Duration::from_millis(millis));
}

// ============================================================================
// Redemption throttle
// ============================================================================

/// Per-source-address failure counter. Only failures count; a legitimate
/// holder typing their password correctly is never throttled.
pub struct RedeemThrottle {
    failures: Mutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl RedeemThrottle {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, source: IpAddr) -> RelayerResult<()> {
        let mut failures = self.failures.lock().unwrap();
        let now = Instant::now();
        // Sweep every source, not just the caller's: the endpoint is
        // unauthenticated, so scanning from many addresses must not grow
        // the map for the life of the process.
        failures.retain(|_, entries| {
            entries.retain(|at| now.duration_since(*at) < FAILURE_WINDOW);
            !entries.is_empty()
        });
        if let Some(entries) = failures.get(&source) {
            if entries.len() >= MAX_FAILURES {
                return Err(RelayerError::TooManyAttempts);
            }
        }
        Ok(())
    }

    pub fn record_failure(&self, source: IpAddr) {
        let mut failures = self.failures.lock().unwrap();
        failures.entry(source).or_default().push(Instant::now());
    }
}

impl Default for RedeemThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, VoucherStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = VoucherStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn code_uses_unambiguous_alphabet() {
        for _ in 0..50 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LEN);
            for c in code.bytes() {
                assert!(CODE_ALPHABET.contains(&c));
                assert!(!b"01OIl".contains(&c));
            }
        }
    }

    #[test]
    fn roundtrip_returns_original_credentials() {
        let (_tmp, store) = store();
        let code = store
            .create("alice@example.com", 17, "hunter2hunter2", "PoolAddr", 5_000_000, "USDC")
            .unwrap();

        let redeemed = store.redeem(&code, "hunter2hunter2").unwrap();
        assert_eq!(redeemed.identifier, "alice@example.com");
        assert_eq!(redeemed.leaf_index, 17);
        assert_eq!(redeemed.amount, 5_000_000);
        assert_eq!(redeemed.token, "USDC");
    }

    #[test]
    fn wrong_password_and_unknown_code_are_indistinguishable() {
        let (_tmp, store) = store();
        let code = store
            .create("bob@example.com", 3, "correct-horse", "Pool", 1, "SOL")
            .unwrap();

        let wrong_password = store.redeem(&code, "battery-staple").unwrap_err();
        let unknown_code = store.redeem("ZZZZZZZZZZZZ", "battery-staple").unwrap_err();
        assert_eq!(wrong_password.to_string(), unknown_code.to_string());
        assert!(matches!(wrong_password, RelayerError::VoucherInvalid));
        assert!(matches!(unknown_code, RelayerError::VoucherInvalid));
    }

    #[test]
    fn redeem_after_mark_claimed_is_already_used() {
        let (_tmp, store) = store();
        let code = store
            .create("carol@example.com", 9, "pw-123456", "Pool", 2, "SOL")
            .unwrap();

        store.mark_claimed(&code, "pw-123456").unwrap();
        let err = store.redeem(&code, "pw-123456").unwrap_err();
        assert!(matches!(err, RelayerError::VoucherAlreadyUsed));

        // Idempotent.
        store.mark_claimed(&code, "pw-123456").unwrap();
    }

    #[test]
    fn mark_claimed_requires_the_password() {
        let (_tmp, store) = store();
        let code = store
            .create("dave@example.com", 1, "real-password", "Pool", 3, "SOL")
            .unwrap();

        let err = store.mark_claimed(&code, "guessed-password").unwrap_err();
        assert!(matches!(err, RelayerError::VoucherInvalid));
        // Still redeemable with the right password.
        assert!(store.redeem(&code, "real-password").is_ok());
    }

    #[test]
    fn status_carries_no_secret_material() {
        let (_tmp, store) = store();
        let code = store
            .create("eve@example.com", 8, "pw-secret-1", "Pool", 42, "USDC")
            .unwrap();
        let status = store.status(&code).unwrap();
        assert_eq!(status.amount, 42);
        assert_eq!(status.token, "USDC");
        assert!(!status.claimed);
    }

    #[test]
    fn codes_are_case_insensitive_on_lookup() {
        let (_tmp, store) = store();
        let code = store
            .create("f@example.com", 2, "pw-abcdef12", "Pool", 1, "SOL")
            .unwrap();
        assert!(store.redeem(&code.to_lowercase(), "pw-abcdef12").is_ok());
    }

    #[test]
    fn rows_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let code = {
            let store = VoucherStore::open(tmp.path()).unwrap();
            store
                .create("g@example.com", 4, "pw-99999999", "Pool", 7, "SOL")
                .unwrap()
        };
        let reopened = VoucherStore::open(tmp.path()).unwrap();
        let redeemed = reopened.redeem(&code, "pw-99999999").unwrap();
        assert_eq!(redeemed.leaf_index, 4);
    }

    #[test]
    fn cleanup_purges_only_old_claimed_rows() {
        let (_tmp, store) = store();
        let claimed_code = store
            .create("h@example.com", 5, "pw-11111111", "Pool", 1, "SOL")
            .unwrap();
        let live_code = store
            .create("i@example.com", 6, "pw-22222222", "Pool", 1, "SOL")
            .unwrap();
        store.mark_claimed(&claimed_code, "pw-11111111").unwrap();

        // Backdate the claimed row past the retention window.
        {
            let mut rows = store.rows.lock().unwrap();
            let row = rows.get_mut(&claimed_code).unwrap();
            row.created_at = (chrono::Utc::now() - chrono::Duration::days(90)).to_rfc3339();
        }

        let removed = store.cleanup(30).unwrap();
        assert_eq!(removed, 1);
        assert!(store.status(&claimed_code).is_err());
        assert!(store.status(&live_code).is_ok());
    }

    #[test]
    fn throttle_trips_after_repeated_failures() {
        let throttle = RedeemThrottle::new();
        let source: IpAddr = "203.0.113.9".parse().unwrap();

        for _ in 0..MAX_FAILURES {
            throttle.check(source).unwrap();
            throttle.record_failure(source);
        }
        assert!(matches!(
            throttle.check(source).unwrap_err(),
            RelayerError::TooManyAttempts
        ));

        // Other sources unaffected.
        let other: IpAddr = "203.0.113.10".parse().unwrap();
        assert!(throttle.check(other).is_ok());
    }

    #[test]
    fn stale_sources_are_evicted_from_the_map() {
        let throttle = RedeemThrottle::new();
        let stale: IpAddr = "198.51.100.7".parse().unwrap();

        // Backdate a tripped source past the window.
        let old = Instant::now() - (FAILURE_WINDOW + Duration::from_secs(1));
        throttle
            .failures
            .lock()
            .unwrap()
            .insert(stale, vec![old; MAX_FAILURES]);

        // Any check sweeps the whole map, including other sources' entries.
        let other: IpAddr = "198.51.100.8".parse().unwrap();
        throttle.check(other).unwrap();
        assert!(!throttle.failures.lock().unwrap().contains_key(&stale));
        assert!(throttle.check(stale).is_ok());
    }
}
