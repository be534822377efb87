//! HTTP handlers for the relayer endpoints
//!
//! Routing, CORS, and generic rate limiting live in front of this service;
//! the handlers own request validation and orchestration. Chain-touching
//! work runs on the blocking pool, and claims carry a wall-clock budget that
//! does not cancel an already-broadcast submission.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task;

use crate::claim::{ClaimOrchestrator, ClaimRequest};
use crate::codec::parse_hex32;
use crate::config::{RelayerConfig, MIN_RELAYER_LAMPORTS};
use crate::deposit_verify::verify_deposit_tx;
use crate::error::{RelayerError, RelayerResult};
use crate::gateway::LedgerGateway;
use crate::index::{deposit_id, identifier_hash, DepositIndex, IndexedDeposit};
use crate::voucher::{RedeemThrottle, VoucherStore};

/// Seam to the external OAuth/email-OTP session service: resolves a bearer
/// token to the identities it is allowed to read.
pub trait SessionVerifier: Send + Sync {
    fn linked_identities(&self, bearer: &str) -> Option<Vec<String>>;
}

/// Config-file-provisioned tokens. Stands in for the external auth service
/// in single-box deployments and tests.
pub struct StaticSessionVerifier {
    sessions: std::collections::HashMap<String, Vec<String>>,
}

impl StaticSessionVerifier {
    pub fn new(sessions: std::collections::HashMap<String, Vec<String>>) -> Self {
        Self { sessions }
    }
}

impl SessionVerifier for StaticSessionVerifier {
    fn linked_identities(&self, bearer: &str) -> Option<Vec<String>> {
        self.sessions.get(bearer).cloned()
    }
}

pub struct AppState {
    pub config: RelayerConfig,
    pub gateway: Arc<LedgerGateway>,
    pub orchestrator: Arc<ClaimOrchestrator>,
    pub index: Arc<DepositIndex>,
    pub vouchers: Arc<VoucherStore>,
    pub throttle: RedeemThrottle,
    pub sessions: Arc<dyn SessionVerifier>,
}

// ============================================================================
// POST /claim
// ============================================================================

pub async fn claim(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClaimRequest>,
) -> RelayerResult<Json<Value>> {
    // Pre-flight: refuse with a 503 rather than failing mid-protocol once
    // the relayer can no longer pay for the upload sequence.
    let balance = {
        let gateway = Arc::clone(&state.gateway);
        task::spawn_blocking(move || gateway.relayer_balance())
            .await
            .map_err(|e| RelayerError::Internal(format!("task join failed: {e}")))??
    };
    if balance < MIN_RELAYER_LAMPORTS {
        return Err(RelayerError::RelayerUnavailable(
            "relayer balance too low".to_string(),
        ));
    }

    let orchestrator = Arc::clone(&state.orchestrator);
    let claim_request = request.clone();
    let work = task::spawn_blocking(move || orchestrator.claim(&claim_request));

    // The timeout bounds the caller's wait; a transaction already broadcast
    // keeps confirming on-chain regardless.
    let outcome = match tokio::time::timeout(state.config.claim_timeout, work).await {
        Ok(joined) => {
            joined.map_err(|e| RelayerError::Internal(format!("task join failed: {e}")))??
        }
        Err(_) => return Err(RelayerError::Timeout),
    };

    // The funds moved; bookkeeping runs best-effort and never turns a
    // confirmed claim into an error response.
    {
        let index = Arc::clone(&state.index);
        let vouchers = Arc::clone(&state.vouchers);
        let request = request.clone();
        if let Err(e) =
            task::spawn_blocking(move || record_claim_success(&index, &vouchers, &request)).await
        {
            tracing::error!(error = %e, "claim bookkeeping task failed");
        }
    }

    Ok(Json(json!({
        "success": true,
        "signature": outcome.signature,
        "chunksWritten": outcome.chunks_written,
        "computeUnits": outcome.compute_units,
    })))
}

/// Post-confirmation bookkeeping: flip the indexed deposit and retire the
/// voucher the claim came from, if any. Failures are logged, never surfaced.
fn record_claim_success(index: &DepositIndex, vouchers: &VoucherStore, request: &ClaimRequest) {
    if let Err(e) = index.mark_claimed(&request.pool_address, request.leaf_index as u64) {
        tracing::error!(
            pool = %request.pool_address,
            leaf_index = request.leaf_index,
            error = %e,
            "failed to record claim in the deposit index"
        );
    }

    if let (Some(code), Some(password)) = (&request.voucher_code, &request.voucher_password) {
        if let Err(e) = vouchers.mark_claimed(code, password) {
            tracing::warn!(error = %e, "failed to retire voucher after claim");
        }
    }
}

// ============================================================================
// GET /pool-info?pool=<base58>
// ============================================================================

#[derive(Deserialize)]
pub struct PoolInfoQuery {
    pool: String,
}

pub async fn pool_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PoolInfoQuery>,
) -> RelayerResult<Json<Value>> {
    let pool: solana_sdk::pubkey::Pubkey = query
        .pool
        .parse()
        .map_err(|_| RelayerError::ValidationFailed("pool: invalid base58 address".to_string()))?;

    let gateway = Arc::clone(&state.gateway);
    let pool_state = task::spawn_blocking(move || gateway.fetch_pool(&pool))
        .await
        .map_err(|e| RelayerError::Internal(format!("task join failed: {e}")))??;

    Ok(Json(json!({
        "pool": query.pool,
        "merkleRoot": hex::encode(pool_state.merkle_root),
        "leafCount": pool_state.leaf_count.to_string(),
    })))
}

// ============================================================================
// POST /deposits/register
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDepositRequest {
    pub identifier: String,
    pub amount: f64,
    #[serde(default)]
    pub token: Option<String>,
    pub leaf_index: u32,
    pub pool: String,
    pub commitment: String,
    pub tx_signature: String,
    #[serde(default)]
    pub password: Option<String>,
}

pub async fn register_deposit(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterDepositRequest>,
) -> RelayerResult<Json<Value>> {
    if request.identifier.trim().is_empty() {
        return Err(RelayerError::ValidationFailed(
            "identifier: must not be empty".to_string(),
        ));
    }

    let pool: solana_sdk::pubkey::Pubkey = request
        .pool
        .parse()
        .map_err(|_| RelayerError::ValidationFailed("pool: invalid base58 address".to_string()))?;
    let commitment = parse_hex32("commitment", &request.commitment)?;

    let token = request
        .token
        .clone()
        .unwrap_or_else(|| "USDC".to_string())
        .to_uppercase();
    let decimals = state
        .config
        .decimals_for(&token)
        .ok_or_else(|| RelayerError::ValidationFailed(format!("token: unknown token {token}")))?;

    // Unauthenticated endpoint: the asserted transaction is checked against
    // on-chain reality before anything is written.
    let gateway = Arc::clone(&state.gateway);
    let tx_signature = request.tx_signature.clone();
    let amount = request.amount;
    let leaf_index = request.leaf_index as u64;
    task::spawn_blocking(move || {
        verify_deposit_tx(
            &gateway,
            &tx_signature,
            &pool,
            &commitment,
            leaf_index,
            amount,
            decimals,
        )
    })
    .await
    .map_err(|e| RelayerError::Internal(format!("task join failed: {e}")))??;

    let base_units = crate::deposit_verify::to_base_units(request.amount, decimals)?;
    let row = IndexedDeposit {
        id: deposit_id(&request.pool, leaf_index),
        pool: request.pool.clone(),
        commitment: hex::encode(commitment),
        identifier_hash: identifier_hash(&request.identifier),
        amount: base_units,
        token: token.clone(),
        leaf_index,
        timestamp: chrono::Utc::now().to_rfc3339(),
        claimed: false,
        tx_signature: request.tx_signature.clone(),
    };
    let deposit_id = state.index.register(row)?;

    // A supplied password also mints a voucher for OTP-free claiming.
    let voucher_code = match &request.password {
        Some(password) if !password.is_empty() => {
            let vouchers = Arc::clone(&state.vouchers);
            let identifier = request.identifier.clone();
            let password = password.clone();
            let pool_str = request.pool.clone();
            let leaf = request.leaf_index;
            let code = task::spawn_blocking(move || {
                vouchers.create(&identifier, leaf, &password, &pool_str, base_units, &token)
            })
            .await
            .map_err(|e| RelayerError::Internal(format!("task join failed: {e}")))??;
            Some(code)
        }
        _ => None,
    };

    Ok(Json(json!({
        "success": true,
        "depositId": deposit_id,
        "voucherCode": voucher_code,
    })))
}

// ============================================================================
// GET /deposits?identity=<string>
// ============================================================================

#[derive(Deserialize)]
pub struct DepositsQuery {
    identity: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DepositView {
    pool: String,
    amount: u64,
    token: String,
    leaf_index: u64,
    commitment: String,
    timestamp: String,
    claimed: bool,
    tx_signature: String,
}

pub async fn list_deposits(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DepositsQuery>,
    headers: HeaderMap,
) -> RelayerResult<Json<Value>> {
    let bearer = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(RelayerError::Unauthorized)?;

    let identities = state
        .sessions
        .linked_identities(bearer)
        .ok_or(RelayerError::Unauthorized)?;

    let requested = query.identity.trim().to_lowercase();
    if !identities
        .iter()
        .any(|identity| identity.trim().to_lowercase() == requested)
    {
        return Err(RelayerError::Unauthorized);
    }

    let deposits: Vec<DepositView> = state
        .index
        .deposits_for(&query.identity)
        .into_iter()
        .map(|row| DepositView {
            pool: row.pool,
            amount: row.amount,
            token: row.token,
            leaf_index: row.leaf_index,
            commitment: row.commitment,
            timestamp: row.timestamp,
            claimed: row.claimed,
            tx_signature: row.tx_signature,
        })
        .collect();

    Ok(Json(json!({ "deposits": deposits })))
}

// ============================================================================
// GET /vouchers/:code
// ============================================================================

pub async fn voucher_status(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> RelayerResult<Json<Value>> {
    let status = state.vouchers.status(&code)?;
    Ok(Json(json!({
        "code": status.code,
        "amount": status.amount,
        "token": status.token,
        "claimed": status.claimed,
    })))
}

// ============================================================================
// POST /vouchers/redeem
// ============================================================================

#[derive(Deserialize)]
pub struct RedeemRequest {
    pub code: String,
    pub password: String,
}

pub async fn redeem_voucher(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<RedeemRequest>,
) -> RelayerResult<Json<Value>> {
    // The password is the sole authentication factor here, so failures are
    // throttled far harder than ordinary traffic.
    state.throttle.check(peer.ip())?;

    let vouchers = Arc::clone(&state.vouchers);
    let result = task::spawn_blocking(move || vouchers.redeem(&request.code, &request.password))
        .await
        .map_err(|e| RelayerError::Internal(format!("task join failed: {e}")))?;

    match result {
        Ok(redeemed) => Ok(Json(json!({
            "identifier": redeemed.identifier,
            "leafIndex": redeemed.leaf_index,
            "pool": redeemed.pool,
            "amount": redeemed.amount,
            "token": redeemed.token,
        }))),
        Err(e) => {
            if matches!(e, RelayerError::VoucherInvalid) {
                state.throttle.record_failure(peer.ip());
            }
            Err(e)
        }
    }
}

// ============================================================================
// GET /health
// ============================================================================

pub async fn health(State(state): State<Arc<AppState>>) -> RelayerResult<Json<Value>> {
    let gateway = Arc::clone(&state.gateway);
    let balance = task::spawn_blocking(move || gateway.relayer_balance())
        .await
        .map_err(|e| RelayerError::Internal(format!("task join failed: {e}")))??;

    Ok(Json(json!({
        "relayer": state.gateway.relayer_pubkey().to_string(),
        "balanceLamports": balance,
        "ready": balance >= MIN_RELAYER_LAMPORTS,
    })))
}
