//! Configuration for the VeilPool relayer
//!
//! Everything operational comes in through the CLI; per-token decimal counts
//! and session tokens live in a JSON file in the data directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;

/// Default directory for relayer state (deposit index, voucher table).
const RELAYER_DIR: &str = ".veilpool";
const CONFIG_FILE: &str = "relayer.json";

/// Hard ceiling the pool program enforces; requests above it never leave
/// validation.
pub const MAX_FEE_BPS: u16 = 100;

/// Minimum relayer SOL balance before claims are refused with a 503.
pub const MIN_RELAYER_LAMPORTS: u64 = 50_000_000; // 0.05 SOL

#[derive(Clone)]
pub struct RelayerConfig {
    pub rpc_url: String,
    pub pool_program: Pubkey,
    pub verifier_program: Pubkey,
    pub data_dir: PathBuf,
    pub production: bool,
    /// Wall-clock budget for a single claim request.
    pub claim_timeout: Duration,
    /// token symbol -> fixed decimal count
    pub token_decimals: HashMap<String, u8>,
    /// bearer token -> linked identities, provisioned by the auth service
    pub session_identities: HashMap<String, Vec<String>>,
}

/// On-disk portion of the config (optional; CLI flags cover the rest).
#[derive(Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub token_decimals: HashMap<String, u8>,
    #[serde(default)]
    pub session_identities: HashMap<String, Vec<String>>,
}

impl RelayerConfig {
    pub fn load(
        rpc_url: String,
        pool_program: &str,
        verifier_program: &str,
        data_dir: Option<&str>,
        production: bool,
        claim_timeout_secs: u64,
    ) -> Result<Self> {
        let pool_program: Pubkey = pool_program
            .parse()
            .context("invalid pool program address")?;
        let verifier_program: Pubkey = verifier_program
            .parse()
            .context("invalid verifier program address")?;

        let data_dir = match data_dir {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir(),
        };
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {data_dir:?}"))?;

        let file = read_config_file(&data_dir.join(CONFIG_FILE))?;

        let mut token_decimals = file.token_decimals;
        // Built-in tokens; the config file may add more but never silently
        // change a deposit's unit math out from under existing rows.
        token_decimals.entry("SOL".to_string()).or_insert(9);
        token_decimals.entry("USDC".to_string()).or_insert(6);
        token_decimals.entry("USDT".to_string()).or_insert(6);

        Ok(Self {
            rpc_url,
            pool_program,
            verifier_program,
            data_dir,
            production,
            claim_timeout: Duration::from_secs(claim_timeout_secs),
            token_decimals,
            session_identities: file.session_identities,
        })
    }

    pub fn decimals_for(&self, token: &str) -> Option<u8> {
        self.token_decimals.get(&token.to_uppercase()).copied()
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(RELAYER_DIR)
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let json = fs::read_to_string(path).context("failed to read config file")?;
    serde_json::from_str(&json).context("failed to parse config file")
}

/// Load the relayer's Solana keypair from file or the default CLI location.
pub fn load_solana_keypair(path: Option<&str>) -> Result<Keypair> {
    let keypair_path = match path {
        Some(p) => PathBuf::from(p),
        None => dirs::home_dir()
            .context("could not find home directory")?
            .join(".config")
            .join("solana")
            .join("id.json"),
    };

    if !keypair_path.exists() {
        bail!(
            "Solana keypair not found at {:?}. Generate one with 'solana-keygen new' or specify path with --keypair",
            keypair_path
        );
    }

    let keypair_json = fs::read_to_string(&keypair_path)?;
    let bytes: Vec<u8> = serde_json::from_str(&keypair_json)?;
    let keypair = Keypair::from_bytes(&bytes)
        .map_err(|e| anyhow::anyhow!("invalid keypair file: {e}"))?;

    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> RelayerConfig {
        RelayerConfig::load(
            "http://localhost:8899".to_string(),
            "11111111111111111111111111111111",
            "Vote111111111111111111111111111111111111111",
            Some(dir.to_str().unwrap()),
            false,
            60,
        )
        .unwrap()
    }

    #[test]
    fn builtin_token_decimals_present() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        assert_eq!(config.decimals_for("SOL"), Some(9));
        assert_eq!(config.decimals_for("usdc"), Some(6));
        assert_eq!(config.decimals_for("UNKNOWN"), None);
    }

    #[test]
    fn config_file_extends_token_table() {
        let tmp = tempfile::tempdir().unwrap();
        let file = ConfigFile {
            token_decimals: HashMap::from([("BONK".to_string(), 5u8)]),
            session_identities: HashMap::new(),
        };
        fs::write(
            tmp.path().join(CONFIG_FILE),
            serde_json::to_string(&file).unwrap(),
        )
        .unwrap();

        let config = test_config(tmp.path());
        assert_eq!(config.decimals_for("BONK"), Some(5));
        assert_eq!(config.decimals_for("SOL"), Some(9));
    }

    #[test]
    fn rejects_bad_program_address() {
        let tmp = tempfile::tempdir().unwrap();
        let result = RelayerConfig::load(
            "http://localhost:8899".to_string(),
            "not-a-pubkey",
            "Vote111111111111111111111111111111111111111",
            Some(tmp.path().to_str().unwrap()),
            false,
            60,
        );
        assert!(result.is_err());
    }
}
