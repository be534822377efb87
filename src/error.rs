//! Relayer error taxonomy and HTTP mapping
//!
//! Syntactic and replay failures are cheap and carry detail to the caller.
//! Anything past the point where on-chain work has started collapses into a
//! generic `Internal` in production; the correlation id in the response ties
//! it back to the verbose server-side log line.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use rand::RngCore;
use serde_json::json;
use thiserror::Error;

/// Set once at startup. In production, `Internal` detail is suppressed.
static PRODUCTION: AtomicBool = AtomicBool::new(true);

pub fn set_production(production: bool) {
    PRODUCTION.store(production, Ordering::Relaxed);
}

fn is_production() -> bool {
    PRODUCTION.load(Ordering::Relaxed)
}

/// Short random correlation id, logged alongside the verbose error.
pub fn correlation_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub type RelayerResult<T> = Result<T, RelayerError>;

#[derive(Debug, Error)]
pub enum RelayerError {
    /// Malformed request input. All violations aggregated, no side effects.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Fast-filter hit: another in-flight request holds this nullifier.
    #[error("a claim for this nullifier is already in progress")]
    DuplicateSubmission,

    /// Canonical replay hit: the nullifier record exists on-chain.
    #[error("nullifier already claimed")]
    AlreadyClaimed,

    /// Buffer create/upload failed. Retryable with a fresh buffer.
    #[error("proof upload failed: {0}")]
    ProofUploadFailed(String),

    /// Finalize or claim simulation rejected the proof.
    #[error("proof verification failed: {0}")]
    VerificationFailed(String),

    /// The asserted deposit transaction did not match on-chain reality.
    /// Deliberately carries no detail; the reason is logged server-side.
    #[error("deposit verification failed")]
    DepositVerificationFailed,

    /// Operational: relayer cannot pay for transactions right now.
    #[error("relayer unavailable: {0}")]
    RelayerUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Wrong password and unknown code collapse into this one shape.
    #[error("invalid voucher code or password")]
    VoucherInvalid,

    #[error("voucher already used")]
    VoucherAlreadyUsed,

    /// Redemption throttle tripped for this source address.
    #[error("too many attempts, try again later")]
    TooManyAttempts,

    #[error("unauthorized")]
    Unauthorized,

    #[error("request timed out")]
    Timeout,

    /// Everything unexpected. Detail suppressed in production responses.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            Self::DuplicateSubmission | Self::AlreadyClaimed => StatusCode::CONFLICT,
            Self::ProofUploadFailed(_)
            | Self::VerificationFailed(_)
            | Self::DepositVerificationFailed
            | Self::VoucherInvalid
            | Self::VoucherAlreadyUsed => StatusCode::BAD_REQUEST,
            Self::RelayerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::TooManyAttempts => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller.
    fn public_message(&self, correlation: &str) -> String {
        match self {
            Self::Internal(detail) => {
                if is_production() {
                    format!("internal error (ref {correlation})")
                } else {
                    format!("internal error (ref {correlation}): {detail}")
                }
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for RelayerError {
    fn into_response(self) -> Response {
        let correlation = correlation_id();
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(ref_id = %correlation, error = %self, "request failed");
        } else {
            tracing::debug!(ref_id = %correlation, error = %self, "request rejected");
        }

        let body = json!({
            "error": self.public_message(&correlation),
            "ref": correlation,
        });
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for RelayerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(
            RelayerError::ValidationFailed("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayerError::AlreadyClaimed.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RelayerError::RelayerUnavailable("balance".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayerError::TooManyAttempts.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn internal_detail_suppressed_in_production() {
        set_production(true);
        let msg = RelayerError::Internal("rpc exploded".into()).public_message("abcd");
        assert!(!msg.contains("rpc exploded"));
        assert!(msg.contains("abcd"));

        set_production(false);
        let msg = RelayerError::Internal("rpc exploded".into()).public_message("abcd");
        assert!(msg.contains("rpc exploded"));
        set_production(true);
    }

    #[test]
    fn voucher_errors_share_one_invalid_shape() {
        // Wrong password and unknown code must be indistinguishable.
        let a = RelayerError::VoucherInvalid.to_string();
        let b = RelayerError::VoucherInvalid.to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn correlation_ids_are_unique_enough() {
        assert_ne!(correlation_id(), correlation_id());
    }
}
