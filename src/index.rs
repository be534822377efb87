//! Deposit index
//!
//! Persisted mapping from a hashed recipient identifier to deposit records,
//! so a recipient can list what is waiting for them. The plaintext
//! identifier is never persisted; rows are keyed by pool+leafIndex so
//! single-row atomic mutations never contend.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RelayerError, RelayerResult};

const DEPOSITS_FILE: &str = "deposits.json";

/// Domain separator for identifier hashing.
const IDENTIFIER_DOMAIN: &[u8] = b"veilpool_identifier_v1";

/// One indexed deposit row.
#[derive(Serialize, Deserialize, Clone)]
pub struct IndexedDeposit {
    /// pool + ":" + leafIndex
    pub id: String,
    pub pool: String,
    pub commitment: String,
    pub identifier_hash: String,
    pub amount: u64,
    pub token: String,
    pub leaf_index: u64,
    pub timestamp: String,
    pub claimed: bool,
    pub tx_signature: String,
}

/// Canonical hash of the normalized (trimmed, lower-cased) identifier.
/// Normalization drift between registration and lookup breaks lookups, so
/// this is the only place it happens.
pub fn identifier_hash(identifier: &str) -> String {
    let normalized = identifier.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(IDENTIFIER_DOMAIN);
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn deposit_id(pool: &str, leaf_index: u64) -> String {
    format!("{pool}:{leaf_index}")
}

pub struct DepositIndex {
    path: PathBuf,
    rows: Mutex<HashMap<String, IndexedDeposit>>,
}

impl DepositIndex {
    pub fn open(data_dir: &Path) -> RelayerResult<Self> {
        let path = data_dir.join(DEPOSITS_FILE);
        let rows = if path.exists() {
            let json = fs::read_to_string(&path)
                .map_err(|e| RelayerError::Internal(format!("failed to read deposit index: {e}")))?;
            serde_json::from_str(&json)
                .map_err(|e| RelayerError::Internal(format!("corrupt deposit index: {e}")))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            rows: Mutex::new(rows),
        })
    }

    fn persist(&self, rows: &HashMap<String, IndexedDeposit>) -> RelayerResult<()> {
        let json = serde_json::to_string_pretty(rows)
            .map_err(|e| RelayerError::Internal(format!("index serialization failed: {e}")))?;
        fs::write(&self.path, &json)
            .map_err(|e| RelayerError::Internal(format!("failed to write deposit index: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    /// Insert a verified deposit. Re-registering the same (pool, leafIndex)
    /// is a no-op returning the existing row's id.
    pub fn register(&self, row: IndexedDeposit) -> RelayerResult<String> {
        let mut rows = self.rows.lock().unwrap();
        let id = row.id.clone();
        if rows.contains_key(&id) {
            return Ok(id);
        }
        rows.insert(id.clone(), row);
        self.persist(&rows)?;
        Ok(id)
    }

    /// All rows for an identifier, by its canonical hash.
    pub fn deposits_for(&self, identifier: &str) -> Vec<IndexedDeposit> {
        let hash = identifier_hash(identifier);
        let rows = self.rows.lock().unwrap();
        let mut matches: Vec<IndexedDeposit> = rows
            .values()
            .filter(|row| row.identifier_hash == hash)
            .cloned()
            .collect();
        matches.sort_by_key(|row| row.leaf_index);
        matches
    }

    /// Monotonic false -> true; flipping an already-claimed row is a no-op.
    pub fn mark_claimed(&self, pool: &str, leaf_index: u64) -> RelayerResult<()> {
        let mut rows = self.rows.lock().unwrap();
        let id = deposit_id(pool, leaf_index);
        match rows.get_mut(&id) {
            Some(row) if row.claimed => Ok(()),
            Some(row) => {
                row.claimed = true;
                self.persist(&rows)
            }
            // Claims for deposits that were never registered are legal;
            // there is simply nothing to update.
            None => Ok(()),
        }
    }
}
