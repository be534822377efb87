//! Scenario tests across module boundaries
//!
//! Per-module unit and property tests live next to the code; these cover the
//! request-level behaviors that span modules: validation surfaces, replay
//! races, and the registration-to-redemption voucher flow.

#[cfg(test)]
mod claim_scenarios {
    use crate::claim::ClaimRequest;
    use crate::error::RelayerError;
    use axum::http::StatusCode;
    use solana_sdk::pubkey::Pubkey;

    fn request_with_fee(fee_bps: u16) -> ClaimRequest {
        ClaimRequest {
            proof: "ab".repeat(512),
            commitment: "aa".repeat(32),
            nullifier: "bb".repeat(32),
            merkle_root: None,
            leaf_index: 12,
            recipient_token_account: Pubkey::new_unique().to_string(),
            pool_address: Pubkey::new_unique().to_string(),
            fee_bps,
            voucher_code: None,
            voucher_password: None,
        }
    }

    #[test]
    fn fee_bps_101_is_a_400_naming_the_field() {
        let err = request_with_fee(101).validate().unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("feeBps"));
        assert!(matches!(err, RelayerError::ValidationFailed(_)));
    }

    #[test]
    fn fee_bps_100_is_accepted() {
        assert!(request_with_fee(100).validate().is_ok());
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let body = serde_json::json!({
            "proof": "ab".repeat(16),
            "commitment": "aa".repeat(32),
            "nullifier": "bb".repeat(32),
            "leafIndex": 4,
            "recipientTokenAccount": solana_sdk::pubkey::Pubkey::new_unique().to_string(),
            "poolAddress": solana_sdk::pubkey::Pubkey::new_unique().to_string(),
            "feeBps": 25,
        });
        let request: ClaimRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.leaf_index, 4);
        assert_eq!(request.fee_bps, 25);
        assert!(request.merkle_root.is_none());
        assert!(request.validate().is_ok());
    }
}

#[cfg(test)]
mod replay_scenarios {
    use crate::error::RelayerError;
    use crate::replay::{NullifierCache, RingCache};
    use std::sync::Arc;

    /// The orchestrator's step 2: exactly one of N same-nullifier races may
    /// proceed past the fast filter; the rest get DuplicateSubmission.
    #[test]
    fn same_nullifier_race_admits_exactly_one() {
        let cache = Arc::new(RingCache::default());
        let nullifier = [0x5a; 32];

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    if cache.track(&nullifier) {
                        Ok(())
                    } else {
                        Err(RelayerError::DuplicateSubmission)
                    }
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(RelayerError::DuplicateSubmission))));
    }

    /// A downstream failure releases the reservation, so a retry of the same
    /// claim is not starved by its own earlier attempt.
    #[test]
    fn failed_attempt_does_not_starve_the_retry() {
        let cache = RingCache::default();
        let nullifier = [0x33; 32];

        assert!(cache.track(&nullifier));
        // ... upload fails downstream, the orchestrator releases ...
        cache.release(&nullifier);
        assert!(cache.track(&nullifier));
    }
}

#[cfg(test)]
mod voucher_flow {
    use crate::error::RelayerError;
    use crate::index::{deposit_id, identifier_hash, DepositIndex, IndexedDeposit};
    use crate::voucher::VoucherStore;

    /// Registration with a password mints a voucher whose redemption returns
    /// exactly the credentials needed to build a claim.
    #[test]
    fn register_then_redeem_yields_claim_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let index = DepositIndex::open(tmp.path()).unwrap();
        let vouchers = VoucherStore::open(tmp.path()).unwrap();

        let pool = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
        index
            .register(IndexedDeposit {
                id: deposit_id(pool, 21),
                pool: pool.to_string(),
                commitment: "cc".repeat(32),
                identifier_hash: identifier_hash("claimer@example.com"),
                amount: 7_500_000,
                token: "USDC".to_string(),
                leaf_index: 21,
                timestamp: chrono::Utc::now().to_rfc3339(),
                claimed: false,
                tx_signature: "tx".to_string(),
            })
            .unwrap();

        let code = vouchers
            .create("claimer@example.com", 21, "pw-s3cret-99", pool, 7_500_000, "USDC")
            .unwrap();

        let redeemed = vouchers.redeem(&code, "pw-s3cret-99").unwrap();
        assert_eq!(redeemed.identifier, "claimer@example.com");
        assert_eq!(redeemed.leaf_index, 21);
        assert_eq!(redeemed.pool, pool);

        // The identifier from the voucher finds the indexed deposit.
        let deposits = index.deposits_for(&redeemed.identifier);
        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].leaf_index, 21);

        // After the claim confirms, both records flip.
        index.mark_claimed(pool, 21).unwrap();
        vouchers.mark_claimed(&code, "pw-s3cret-99").unwrap();
        assert!(index.deposits_for("claimer@example.com")[0].claimed);
        assert!(matches!(
            vouchers.redeem(&code, "pw-s3cret-99").unwrap_err(),
            RelayerError::VoucherAlreadyUsed
        ));
    }
}

#[cfg(test)]
mod deposit_verification_scenarios {
    use crate::deposit_verify::{matches_deposit_instruction, ExpectedDeposit};
    use crate::gateway::{deposit_address, instruction_tag};
    use solana_sdk::pubkey::Pubkey;

    /// `/deposits/register` with a real transaction that deposits into a
    /// different pool: the instruction is well-formed but the pool account
    /// does not match, so verification fails.
    #[test]
    fn deposit_into_a_different_pool_is_rejected() {
        let pool_program = Pubkey::new_unique();
        let claimed_pool = Pubkey::new_unique();
        let actual_pool = Pubkey::new_unique();
        let leaf_index = 11u64;
        let commitment = [0x77; 32];
        let amount = 2_000_000u64;

        let expected = ExpectedDeposit {
            pool: claimed_pool,
            deposit_address: deposit_address(&claimed_pool, leaf_index, &pool_program),
            amount,
            commitment,
        };

        // The transaction's instruction references the *actual* pool and its
        // deposit PDA.
        let mut data = Vec::new();
        data.extend_from_slice(&instruction_tag("deposit"));
        data.extend_from_slice(&amount.to_le_bytes());
        data.extend_from_slice(&commitment);
        let keys = vec![
            Pubkey::new_unique(),
            actual_pool,
            deposit_address(&actual_pool, leaf_index, &pool_program),
        ];

        assert!(!matches_deposit_instruction(&data, &[1, 2], &keys, &expected));
    }
}
