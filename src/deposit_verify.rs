//! Deposit transaction verification
//!
//! `/deposits/register` is unauthenticated; without this check anyone could
//! poison the index with rows pointing at other people's deposits (or at
//! nothing). A registration is accepted only when the referenced transaction
//! really contains a matching deposit instruction AND the deposit account it
//! created still matches, re-read independently from the ledger.
//!
//! The caller only ever sees a generic `DepositVerificationFailed`; the
//! precise reason is logged server-side.

use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::{UiInstruction, UiTransactionStatusMeta};

use crate::error::{RelayerError, RelayerResult};
use crate::gateway::{deposit_address, instruction_tag, LedgerGateway};

/// Deposit instruction payload: tag(8) + amount u64 LE + commitment[32].
const DEPOSIT_IX_LEN: usize = 8 + 8 + 32;

/// What the registration request asserts the transaction did.
pub struct ExpectedDeposit {
    pub pool: Pubkey,
    pub deposit_address: Pubkey,
    pub amount: u64,
    pub commitment: [u8; 32],
}

/// Convert a human token amount to base units via the token's fixed decimal
/// count. Rejects non-finite and non-positive amounts.
pub fn to_base_units(amount: f64, decimals: u8) -> RelayerResult<u64> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(RelayerError::ValidationFailed(
            "amount: must be a positive finite number".to_string(),
        ));
    }
    let scaled = amount * 10f64.powi(decimals as i32);
    if !scaled.is_finite() || scaled >= u64::MAX as f64 {
        return Err(RelayerError::ValidationFailed(
            "amount: out of range".to_string(),
        ));
    }
    let units = scaled.round();
    if units < 1.0 {
        return Err(RelayerError::ValidationFailed(
            "amount: below the smallest token unit".to_string(),
        ));
    }
    Ok(units as u64)
}

/// Pure match of one decoded instruction against the asserted deposit.
/// All of {amount, commitment, pool, deposit record} must match exactly;
/// a partial match is a mismatch.
pub fn matches_deposit_instruction(
    data: &[u8],
    account_indexes: &[u8],
    account_keys: &[Pubkey],
    expected: &ExpectedDeposit,
) -> bool {
    if data.len() < DEPOSIT_IX_LEN {
        return false;
    }
    if data[..8] != instruction_tag("deposit") {
        return false;
    }

    let mut amount_bytes = [0u8; 8];
    amount_bytes.copy_from_slice(&data[8..16]);
    let amount = u64::from_le_bytes(amount_bytes);

    let mut commitment = [0u8; 32];
    commitment.copy_from_slice(&data[16..48]);

    // Account list: [0] = pool, [1] = deposit record.
    if account_indexes.len() < 2 {
        return false;
    }
    let pool = match account_keys.get(account_indexes[0] as usize) {
        Some(key) => key,
        None => return false,
    };
    let deposit_record = match account_keys.get(account_indexes[1] as usize) {
        Some(key) => key,
        None => return false,
    };

    amount == expected.amount
        && commitment == expected.commitment
        && *pool == expected.pool
        && *deposit_record == expected.deposit_address
}

fn fail(reason: String) -> RelayerError {
    tracing::warn!(%reason, "deposit verification failed");
    RelayerError::DepositVerificationFailed
}

/// Verify that `tx_signature` really is the deposit it is claimed to be.
///
/// 1. Convert the human amount to base units.
/// 2. Fetch the transaction at confirmed commitment; absent or failed
///    transactions are rejected.
/// 3. Enumerate top-level and inner instructions, keeping those addressed to
///    the pool program with the deposit tag.
/// 4. Require one candidate matching amount, commitment, pool, and the
///    deposit PDA computed from (pool, leaf_index).
/// 5. Independently re-read the deposit account and cross-check every field,
///    guarding against a matched-but-mutated or forged replay.
pub fn verify_deposit_tx(
    gateway: &LedgerGateway,
    tx_signature: &str,
    pool: &Pubkey,
    commitment: &[u8; 32],
    leaf_index: u64,
    human_amount: f64,
    decimals: u8,
) -> RelayerResult<Pubkey> {
    let amount = to_base_units(human_amount, decimals)?;

    let signature: Signature = tx_signature
        .parse()
        .map_err(|_| RelayerError::ValidationFailed("txSignature: invalid signature".to_string()))?;

    let expected = ExpectedDeposit {
        pool: *pool,
        deposit_address: deposit_address(pool, leaf_index, &gateway.pool_program),
        amount,
        commitment: *commitment,
    };

    let fetched = gateway
        .fetch_transaction(&signature)?
        .ok_or_else(|| fail(format!("transaction {signature} not found")))?;

    let meta = fetched
        .transaction
        .meta
        .as_ref()
        .ok_or_else(|| fail("transaction meta unavailable".to_string()))?;
    if meta.err.is_some() {
        return Err(fail(format!("transaction {signature} failed on-chain")));
    }

    let decoded = fetched
        .transaction
        .transaction
        .decode()
        .ok_or_else(|| fail("could not decode transaction".to_string()))?;

    let account_keys = full_account_keys(decoded.message.static_account_keys(), meta);

    let mut matched = false;

    // Top-level instructions.
    for instruction in decoded.message.instructions() {
        let program = account_keys.get(instruction.program_id_index as usize);
        if program != Some(&gateway.pool_program) {
            continue;
        }
        if matches_deposit_instruction(
            &instruction.data,
            &instruction.accounts,
            &account_keys,
            &expected,
        ) {
            matched = true;
            break;
        }
    }

    // Inner (CPI) instructions - a wallet or router may wrap the deposit.
    if !matched {
        if let OptionSerializer::Some(inner_sets) = &meta.inner_instructions {
            'outer: for set in inner_sets {
                for inner in &set.instructions {
                    let UiInstruction::Compiled(compiled) = inner else {
                        continue;
                    };
                    let program = account_keys.get(compiled.program_id_index as usize);
                    if program != Some(&gateway.pool_program) {
                        continue;
                    }
                    let Ok(data) = bs58::decode(&compiled.data).into_vec() else {
                        continue;
                    };
                    if matches_deposit_instruction(
                        &data,
                        &compiled.accounts,
                        &account_keys,
                        &expected,
                    ) {
                        matched = true;
                        break 'outer;
                    }
                }
            }
        }
    }

    if !matched {
        return Err(fail(format!(
            "no matching deposit instruction in {signature}"
        )));
    }

    // Independent re-read of the deposit account itself.
    let deposit = gateway
        .fetch_deposit(&expected.deposit_address)?
        .ok_or_else(|| fail("deposit account missing or not program-owned".to_string()))?;

    if deposit.pool != *pool {
        return Err(fail("deposit account pool mismatch".to_string()));
    }
    if deposit.commitment != *commitment {
        return Err(fail("deposit account commitment mismatch".to_string()));
    }
    if deposit.amount != amount {
        return Err(fail("deposit account amount mismatch".to_string()));
    }
    if deposit.leaf_index != leaf_index {
        return Err(fail("deposit account leaf index mismatch".to_string()));
    }

    Ok(expected.deposit_address)
}

/// Static keys plus any address-lookup-table keys (writable, then readonly),
/// matching the runtime's flattened ordering.
fn full_account_keys(static_keys: &[Pubkey], meta: &UiTransactionStatusMeta) -> Vec<Pubkey> {
    let mut keys: Vec<Pubkey> = static_keys.to_vec();
    if let OptionSerializer::Some(loaded) = &meta.loaded_addresses {
        for address in loaded.writable.iter().chain(loaded.readonly.iter()) {
            if let Ok(key) = address.parse() {
                keys.push(key);
            }
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected() -> (ExpectedDeposit, Vec<Pubkey>) {
        let pool = Pubkey::new_unique();
        let deposit = Pubkey::new_unique();
        let keys = vec![Pubkey::new_unique(), pool, deposit, Pubkey::new_unique()];
        (
            ExpectedDeposit {
                pool,
                deposit_address: deposit,
                amount: 5_000_000,
                commitment: [0x11; 32],
            },
            keys,
        )
    }

    fn deposit_data(amount: u64, commitment: [u8; 32]) -> Vec<u8> {
        let mut data = Vec::with_capacity(DEPOSIT_IX_LEN);
        data.extend_from_slice(&instruction_tag("deposit"));
        data.extend_from_slice(&amount.to_le_bytes());
        data.extend_from_slice(&commitment);
        data
    }

    #[test]
    fn well_formed_instruction_matches() {
        let (exp, keys) = expected();
        let data = deposit_data(5_000_000, [0x11; 32]);
        assert!(matches_deposit_instruction(&data, &[1, 2], &keys, &exp));
    }

    #[test]
    fn mutating_any_field_fails() {
        let (exp, keys) = expected();

        // Wrong amount.
        let data = deposit_data(5_000_001, [0x11; 32]);
        assert!(!matches_deposit_instruction(&data, &[1, 2], &keys, &exp));

        // Wrong commitment.
        let data = deposit_data(5_000_000, [0x12; 32]);
        assert!(!matches_deposit_instruction(&data, &[1, 2], &keys, &exp));

        // Wrong pool account.
        let data = deposit_data(5_000_000, [0x11; 32]);
        assert!(!matches_deposit_instruction(&data, &[0, 2], &keys, &exp));

        // Wrong deposit record account.
        assert!(!matches_deposit_instruction(&data, &[1, 3], &keys, &exp));
    }

    #[test]
    fn wrong_tag_or_short_data_fails() {
        let (exp, keys) = expected();

        let mut data = deposit_data(5_000_000, [0x11; 32]);
        data[0] ^= 0x01;
        assert!(!matches_deposit_instruction(&data, &[1, 2], &keys, &exp));

        let data = deposit_data(5_000_000, [0x11; 32]);
        assert!(!matches_deposit_instruction(&data[..40], &[1, 2], &keys, &exp));
    }

    #[test]
    fn out_of_range_account_index_fails() {
        let (exp, keys) = expected();
        let data = deposit_data(5_000_000, [0x11; 32]);
        assert!(!matches_deposit_instruction(&data, &[1, 9], &keys, &exp));
        assert!(!matches_deposit_instruction(&data, &[1], &keys, &exp));
    }

    #[test]
    fn base_unit_conversion() {
        assert_eq!(to_base_units(1.5, 9).unwrap(), 1_500_000_000);
        assert_eq!(to_base_units(0.000001, 6).unwrap(), 1);
        assert_eq!(to_base_units(25.0, 6).unwrap(), 25_000_000);
    }

    #[test]
    fn rejects_bad_amounts() {
        assert!(to_base_units(0.0, 9).is_err());
        assert!(to_base_units(-1.0, 9).is_err());
        assert!(to_base_units(f64::NAN, 9).is_err());
        assert!(to_base_units(f64::INFINITY, 9).is_err());
        // Below the smallest representable unit.
        assert!(to_base_units(0.0000001, 6).is_err());
        // Overflows u64 once scaled.
        assert!(to_base_units(1e19, 9).is_err());
    }
}
