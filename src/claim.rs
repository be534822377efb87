//! Claim orchestration
//!
//! Top-level flow for `POST /claim`: validate, replay-check, drive the proof
//! buffer, recompute the fee from the on-chain amount, then simulate and
//! submit the claim transaction. Synchronous per request; no background
//! queue. Steps before any chain write are side-effect-free except the
//! fast-filter reservation, which is unwound on every failure path.

use std::sync::Arc;

use serde::Deserialize;
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    system_program,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};

use crate::codec::{parse_hex32, parse_hex_field};
use crate::config::MAX_FEE_BPS;
use crate::error::{RelayerError, RelayerResult};
use crate::gateway::{deposit_address, instruction_tag, vault_address, LedgerGateway};
use crate::proof_buffer::{ProofBufferClient, MAX_PROOF_SIZE};
use crate::replay::{check_onchain_unspent, NullifierCache};

/// Raw claim request as it arrives over HTTP. Discarded after the response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub proof: String,
    pub commitment: String,
    pub nullifier: String,
    #[serde(default)]
    pub merkle_root: Option<String>,
    pub leaf_index: u32,
    pub recipient_token_account: String,
    pub pool_address: String,
    pub fee_bps: u16,
    /// Present when the claim was assembled from a redeemed voucher; the
    /// voucher is retired once the claim confirms.
    #[serde(default)]
    pub voucher_code: Option<String>,
    #[serde(default)]
    pub voucher_password: Option<String>,
}

/// Fully validated claim, every field in its wire form.
#[derive(Debug)]
pub struct ValidClaim {
    pub proof: Vec<u8>,
    pub commitment: [u8; 32],
    pub nullifier: [u8; 32],
    pub merkle_root: Option<[u8; 32]>,
    pub leaf_index: u32,
    pub recipient: Pubkey,
    pub pool: Pubkey,
    pub fee_bps: u16,
}

impl ClaimRequest {
    /// Validate every field, aggregating all violations rather than failing
    /// on the first; the caller gets one `ValidationFailed` naming each one.
    pub fn validate(&self) -> RelayerResult<ValidClaim> {
        let mut violations: Vec<String> = Vec::new();

        let proof = match parse_hex_field("proof", &self.proof, 1, MAX_PROOF_SIZE) {
            Ok(bytes) => bytes,
            Err(e) => {
                violations.push(e.to_string());
                Vec::new()
            }
        };

        let commitment = parse_hex32("commitment", &self.commitment).unwrap_or_else(|e| {
            violations.push(e.to_string());
            [0u8; 32]
        });
        let nullifier = parse_hex32("nullifier", &self.nullifier).unwrap_or_else(|e| {
            violations.push(e.to_string());
            [0u8; 32]
        });

        let merkle_root = match &self.merkle_root {
            Some(root) => match parse_hex32("merkleRoot", root) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    violations.push(e.to_string());
                    None
                }
            },
            None => None,
        };

        let recipient: Pubkey = self
            .recipient_token_account
            .parse()
            .unwrap_or_else(|_| {
                violations.push("recipientTokenAccount: invalid base58 address".to_string());
                Pubkey::default()
            });
        let pool: Pubkey = self.pool_address.parse().unwrap_or_else(|_| {
            violations.push("poolAddress: invalid base58 address".to_string());
            Pubkey::default()
        });

        if self.fee_bps > MAX_FEE_BPS {
            violations.push(format!(
                "feeBps: must be between 0 and {MAX_FEE_BPS}, got {}",
                self.fee_bps
            ));
        }

        if !violations.is_empty() {
            return Err(RelayerError::ValidationFailed(violations.join("; ")));
        }

        Ok(ValidClaim {
            proof,
            commitment,
            nullifier,
            merkle_root,
            leaf_index: self.leaf_index,
            recipient,
            pool,
            fee_bps: self.fee_bps,
        })
    }
}

/// fee = floor(amount * fee_bps / 10000), always from the on-chain amount.
pub fn compute_fee(amount: u64, fee_bps: u16) -> u64 {
    (amount as u128 * fee_bps as u128 / 10_000) as u64
}

/// Successful claim summary returned to the caller.
pub struct ClaimOutcome {
    pub signature: String,
    pub chunks_written: u32,
    pub compute_units: Option<u64>,
}

pub struct ClaimOrchestrator {
    gateway: Arc<LedgerGateway>,
    cache: Arc<dyn NullifierCache>,
}

impl ClaimOrchestrator {
    pub fn new(gateway: Arc<LedgerGateway>, cache: Arc<dyn NullifierCache>) -> Self {
        Self { gateway, cache }
    }

    pub fn claim(&self, request: &ClaimRequest) -> RelayerResult<ClaimOutcome> {
        // Step 1: syntax. No side effects.
        let valid = request.validate()?;

        // Step 2: fast replay filter. The only local side effect before
        // chain work, unwound below on any failure.
        if !self.cache.track(&valid.nullifier) {
            return Err(RelayerError::DuplicateSubmission);
        }

        let result = self.claim_inner(&valid);
        if result.is_err() {
            self.cache.release(&valid.nullifier);
        }
        result
    }

    fn claim_inner(&self, claim: &ValidClaim) -> RelayerResult<ClaimOutcome> {
        let gateway = &self.gateway;

        // Step 3: resolve the merkle root and derive addresses.
        let pool_state = gateway.fetch_pool(&claim.pool)?;
        let merkle_root = match claim.merkle_root {
            Some(root) => {
                // A caller-supplied root is cross-checked against the pool's
                // current root before any buffer work; the verifier program
                // would reject a stale root anyway, but only after we had
                // paid for the whole upload.
                if root != pool_state.merkle_root {
                    return Err(RelayerError::VerificationFailed(
                        "merkleRoot: does not match the pool's current root".to_string(),
                    ));
                }
                root
            }
            None => pool_state.merkle_root,
        };

        let leaf_index = claim.leaf_index as u64;
        let deposit_addr = deposit_address(&claim.pool, leaf_index, &gateway.pool_program);
        let vault = vault_address(&claim.pool, &gateway.pool_program);

        // Step 4: canonical on-chain replay check.
        let nullifier_record = check_onchain_unspent(gateway, &claim.pool, &claim.nullifier)?;

        let deposit = gateway
            .fetch_deposit(&deposit_addr)?
            .ok_or_else(|| RelayerError::NotFound(format!("deposit at leaf {leaf_index}")))?;
        if deposit.claimed {
            return Err(RelayerError::AlreadyClaimed);
        }

        // Destination accounts for unknown owners are never created.
        if !gateway.account_exists(&claim.recipient)? {
            return Err(RelayerError::ValidationFailed(
                "recipientTokenAccount: account does not exist".to_string(),
            ));
        }

        // Step 5: drive the proof buffer end-to-end.
        let buffer_client = ProofBufferClient::new(gateway);
        let mut buffer = buffer_client.create_and_init(claim.proof.len())?;
        buffer_client.upload(&mut buffer, &claim.proof)?;
        buffer_client.finalize_and_verify(
            &mut buffer,
            &claim.commitment,
            &claim.nullifier,
            &merkle_root,
            &claim.recipient,
        )?;

        // Step 6: fee from the authoritative on-chain amount, re-read after
        // the upload. Never trusted from the request.
        let deposit = gateway
            .fetch_deposit(&deposit_addr)?
            .ok_or_else(|| RelayerError::Internal("deposit disappeared mid-claim".to_string()))?;
        if deposit.claimed {
            return Err(RelayerError::AlreadyClaimed);
        }
        let fee = compute_fee(deposit.amount, claim.fee_bps);

        // Step 7: assemble the claim transaction.
        let fee_account =
            get_associated_token_address(&gateway.relayer_pubkey(), &pool_state.token_mint);
        let create_fee_account = create_associated_token_account_idempotent(
            &gateway.relayer_pubkey(),
            &gateway.relayer_pubkey(),
            &pool_state.token_mint,
            &spl_token::id(),
        );

        let mut data = Vec::with_capacity(8 + 32 + 8);
        data.extend_from_slice(&instruction_tag("claim"));
        data.extend_from_slice(&claim.nullifier);
        data.extend_from_slice(&fee.to_le_bytes());

        let claim_ix = Instruction {
            program_id: gateway.pool_program,
            accounts: vec![
                AccountMeta::new_readonly(claim.pool, false),
                AccountMeta::new(deposit_addr, false),
                AccountMeta::new_readonly(buffer.address(), false),
                AccountMeta::new(nullifier_record, false),
                AccountMeta::new(vault, false),
                AccountMeta::new(claim.recipient, false),
                AccountMeta::new(gateway.relayer_pubkey(), true),
                AccountMeta::new(fee_account, false),
                AccountMeta::new_readonly(spl_token::id(), false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data,
        };
        let instructions = [create_fee_account, claim_ix];

        // Step 8: simulate first - a rejected claim must not spend a fee.
        let simulation = gateway.simulate(&instructions)?;
        if let Some(err) = simulation.err {
            let diagnostic = classify_claim_failure(&err, &simulation.logs);
            tracing::warn!(pool = %claim.pool, leaf_index, %err, %diagnostic, "claim simulation failed");
            return Err(RelayerError::VerificationFailed(diagnostic));
        }

        // Step 9: submit and confirm.
        let signature = gateway.send_confirmed(&instructions, &[])?;
        tracing::info!(
            pool = %claim.pool,
            leaf_index,
            %signature,
            chunks = buffer.chunks_written(),
            "claim confirmed"
        );

        // Happy-path rent reclaim. Best-effort only.
        if let Err(e) = buffer_client.close(&buffer) {
            tracing::warn!(buffer = %buffer.address(), error = %e, "failed to close proof buffer");
        }

        Ok(ClaimOutcome {
            signature: signature.to_string(),
            chunks_written: buffer.chunks_written(),
            compute_units: simulation.units_consumed,
        })
    }
}

/// Map known on-chain failure codes into operator-readable diagnostics.
fn classify_claim_failure(err: &str, logs: &[String]) -> String {
    const KNOWN: &[(&str, &str)] = &[
        ("0x1770", "proof rejected by verifier"),
        ("0x1771", "nullifier already used"),
        ("0x1772", "merkle root not current"),
        ("0x1773", "deposit already claimed"),
        ("0x1774", "insufficient vault balance"),
    ];

    for line in logs {
        for (code, diagnostic) in KNOWN {
            if line.contains(code) {
                return (*diagnostic).to_string();
            }
        }
    }
    for (code, diagnostic) in KNOWN {
        if err.contains(code) {
            return (*diagnostic).to_string();
        }
    }
    format!("claim simulation failed: {err}")
}
