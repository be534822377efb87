//! Ledger gateway - thin read/derive/build/simulate/submit wrapper
//!
//! Everything the relayer knows about the pool and verifier programs lives
//! here: PDA seed layouts, instruction tags, and the fixed-offset account
//! decoders. The byte layouts MUST match the on-chain programs exactly;
//! all multi-byte fields are little-endian and every account starts with an
//! 8-byte Anchor discriminator.

use borsh::BorshDeserialize;
use sha2::{Digest, Sha256};
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::rpc_client::RpcClient;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signature},
    signer::Signer,
    transaction::Transaction,
};
use solana_transaction_status::{EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding};

use crate::error::{RelayerError, RelayerResult};

/// PDA seed prefixes (fixed UTF-8, shared with the on-chain programs).
pub const POOL_SEED: &[u8] = b"pool";
pub const VAULT_SEED: &[u8] = b"vault";
pub const DEPOSIT_SEED: &[u8] = b"deposit";
pub const NULLIFIER_SEED: &[u8] = b"nullifier";

/// Compute the 8-byte Anchor instruction tag: sha256("global:<name>")[..8].
pub fn instruction_tag(name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("global:{name}").as_bytes());
    let digest = hasher.finalize();
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&digest[..8]);
    tag
}

/// Compute the 8-byte account discriminator: sha256("account:<Name>")[..8].
pub fn account_tag(name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("account:{name}").as_bytes());
    let digest = hasher.finalize();
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&digest[..8]);
    tag
}

/// Vault PDA: "vault" ++ pool
pub fn vault_address(pool: &Pubkey, pool_program: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[VAULT_SEED, pool.as_ref()], pool_program).0
}

/// Deposit PDA: "deposit" ++ pool ++ leaf_index LE8.
/// The deposit address is a pure function of (pool, leaf_index).
pub fn deposit_address(pool: &Pubkey, leaf_index: u64, pool_program: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[DEPOSIT_SEED, pool.as_ref(), &leaf_index.to_le_bytes()],
        pool_program,
    )
    .0
}

/// Nullifier record PDA: "nullifier" ++ pool ++ nullifier.
/// Existence of this account means the nullifier has been spent.
pub fn nullifier_address(pool: &Pubkey, nullifier: &[u8; 32], pool_program: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[NULLIFIER_SEED, pool.as_ref(), nullifier], pool_program).0
}

// ============================================================================
// Typed account decoders
// ============================================================================

/// Pool account - MUST match the on-chain definition exactly.
#[derive(BorshDeserialize, Debug, Clone)]
pub struct PoolAccount {
    pub authority: Pubkey,
    pub token_mint: Pubkey,
    pub merkle_root: [u8; 32],
    pub leaf_count: u64,
    pub bump: u8,
}

impl PoolAccount {
    /// Size of the account data after the discriminator.
    pub const SIZE: usize = 32 + 32 + 32 + 8 + 1;
}

/// Deposit account - one per leaf, created by the depositor's transaction.
#[derive(BorshDeserialize, Debug, Clone)]
pub struct DepositAccount {
    pub pool: Pubkey,
    pub commitment: [u8; 32],
    pub amount: u64,
    pub leaf_index: u64,
    pub claimed: bool,
}

impl DepositAccount {
    pub const SIZE: usize = 32 + 32 + 8 + 8 + 1;
}

/// Proof buffer account header (verifier program). Proof bytes follow.
#[derive(BorshDeserialize, Debug, Clone)]
pub struct ProofBufferHeader {
    pub owner: Pubkey,
    pub expected_size: u32,
    pub uploaded_size: u32,
    pub finalized: bool,
    pub commitment: [u8; 32],
    pub nullifier: [u8; 32],
    pub merkle_root: [u8; 32],
}

impl ProofBufferHeader {
    pub const SIZE: usize = 32 + 4 + 4 + 1 + 32 + 32 + 32;
}

/// Decode an account of a known kind: length check first, then the
/// discriminator, then the fixed-offset fields. Never reads past SIZE.
pub fn decode_account<T: BorshDeserialize>(
    kind: &str,
    data: &[u8],
    size: usize,
) -> RelayerResult<T> {
    if data.len() < 8 + size {
        return Err(RelayerError::Internal(format!(
            "{kind} account too short: {} bytes, need {}",
            data.len(),
            8 + size
        )));
    }
    let expected_tag = account_tag(kind);
    if data[..8] != expected_tag {
        return Err(RelayerError::Internal(format!(
            "{kind} account has wrong discriminator"
        )));
    }
    T::deserialize(&mut &data[8..8 + size])
        .map_err(|e| RelayerError::Internal(format!("failed to decode {kind} account: {e}")))
}

// ============================================================================
// Gateway
// ============================================================================

/// Outcome of a transaction simulation.
pub struct SimulationOutcome {
    pub err: Option<String>,
    pub logs: Vec<String>,
    pub units_consumed: Option<u64>,
}

pub struct LedgerGateway {
    rpc: RpcClient,
    relayer: Keypair,
    pub pool_program: Pubkey,
    pub verifier_program: Pubkey,
}

impl LedgerGateway {
    pub fn new(
        rpc_url: &str,
        relayer: Keypair,
        pool_program: Pubkey,
        verifier_program: Pubkey,
    ) -> Self {
        let rpc =
            RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed());
        Self {
            rpc,
            relayer,
            pool_program,
            verifier_program,
        }
    }

    pub fn relayer_pubkey(&self) -> Pubkey {
        self.relayer.pubkey()
    }

    pub fn relayer_keypair(&self) -> &Keypair {
        &self.relayer
    }

    pub fn relayer_balance(&self) -> RelayerResult<u64> {
        self.rpc
            .get_balance(&self.relayer.pubkey())
            .map_err(|e| RelayerError::Internal(format!("balance query failed: {e}")))
    }

    /// True if the account exists at confirmed commitment.
    pub fn account_exists(&self, address: &Pubkey) -> RelayerResult<bool> {
        let response = self
            .rpc
            .get_account_with_commitment(address, CommitmentConfig::confirmed())
            .map_err(|e| RelayerError::Internal(format!("account query failed: {e}")))?;
        Ok(response.value.is_some())
    }

    /// Fetch raw account data, or None if the account does not exist.
    pub fn fetch_account_data(&self, address: &Pubkey) -> RelayerResult<Option<(Pubkey, Vec<u8>)>> {
        let response = self
            .rpc
            .get_account_with_commitment(address, CommitmentConfig::confirmed())
            .map_err(|e| RelayerError::Internal(format!("account query failed: {e}")))?;
        Ok(response.value.map(|account| (account.owner, account.data)))
    }

    pub fn fetch_pool(&self, pool: &Pubkey) -> RelayerResult<PoolAccount> {
        let (owner, data) = self
            .fetch_account_data(pool)?
            .ok_or_else(|| RelayerError::NotFound(format!("pool {pool}")))?;
        if owner != self.pool_program {
            return Err(RelayerError::ValidationFailed(
                "poolAddress: not owned by the pool program".to_string(),
            ));
        }
        decode_account("Pool", &data, PoolAccount::SIZE)
    }

    pub fn fetch_deposit(&self, deposit: &Pubkey) -> RelayerResult<Option<DepositAccount>> {
        match self.fetch_account_data(deposit)? {
            Some((owner, data)) if owner == self.pool_program => {
                Ok(Some(decode_account("Deposit", &data, DepositAccount::SIZE)?))
            }
            _ => Ok(None),
        }
    }

    pub fn fetch_transaction(
        &self,
        signature: &Signature,
    ) -> RelayerResult<Option<EncodedConfirmedTransactionWithStatusMeta>> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        match self.rpc.get_transaction_with_config(signature, config) {
            Ok(tx) => Ok(Some(tx)),
            Err(e) if is_missing_transaction(&e) => Ok(None),
            Err(e) => Err(RelayerError::Internal(format!(
                "transaction query failed: {e}"
            ))),
        }
    }

    pub fn rent_exempt_minimum(&self, space: usize) -> RelayerResult<u64> {
        self.rpc
            .get_minimum_balance_for_rent_exemption(space)
            .map_err(|e| RelayerError::Internal(format!("rent query failed: {e}")))
    }

    /// Build, sign, submit, and confirm a transaction paid by the relayer.
    /// `extra_signers` covers ephemeral keys such as a fresh proof buffer.
    pub fn send_confirmed(
        &self,
        instructions: &[Instruction],
        extra_signers: &[&Keypair],
    ) -> RelayerResult<Signature> {
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .map_err(|e| RelayerError::Internal(format!("blockhash query failed: {e}")))?;

        let mut signers: Vec<&Keypair> = vec![&self.relayer];
        signers.extend_from_slice(extra_signers);

        let transaction = Transaction::new_signed_with_payer(
            instructions,
            Some(&self.relayer.pubkey()),
            &signers,
            blockhash,
        );

        self.rpc
            .send_and_confirm_transaction(&transaction)
            .map_err(|e| RelayerError::Internal(format!("transaction failed: {e}")))
    }

    /// Simulate without broadcasting. Spends no fee.
    pub fn simulate(&self, instructions: &[Instruction]) -> RelayerResult<SimulationOutcome> {
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .map_err(|e| RelayerError::Internal(format!("blockhash query failed: {e}")))?;

        let transaction = Transaction::new_signed_with_payer(
            instructions,
            Some(&self.relayer.pubkey()),
            &[&self.relayer],
            blockhash,
        );

        let response = self
            .rpc
            .simulate_transaction(&transaction)
            .map_err(|e| RelayerError::Internal(format!("simulation failed: {e}")))?;

        Ok(SimulationOutcome {
            err: response.value.err.map(|e| format!("{e:?}")),
            logs: response.value.logs.unwrap_or_default(),
            units_consumed: response.value.units_consumed,
        })
    }
}

/// An unknown signature comes back from the RPC as a null result, which the
/// client surfaces as a deserialization failure. Every other error kind
/// (transport, rate limits, node errors) keeps flowing as a real error.
fn is_missing_transaction(error: &ClientError) -> bool {
    matches!(error.kind(), ClientErrorKind::SerdeJson(_))
}
