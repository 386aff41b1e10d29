//! Payjoin negotiation endpoint

use super::{ApiResponse, ApiState};
use crate::invoice::InvoiceId;
use crate::negotiator::{NegotiationError, Outcome};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use bitcoin::consensus::encode;
use bitcoin::Transaction;
use serde::Serialize;
use tracing::{debug, error, warn};

/// Payjoin negotiation response
#[derive(Debug, Serialize)]
pub struct PayjoinResponse {
    /// The transaction for the payer to sign and broadcast, consensus hex
    pub transaction_hex: String,
    /// Whether a receiver coin was contributed. When `false` the returned
    /// transaction is the untouched original and `reason` explains why.
    pub payjoin: bool,
    /// Reason for a degraded outcome
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Submit a payjoin candidate transaction for an invoice.
///
/// Body: the payer's signed candidate, consensus hex. Returns 200 with the
/// unsigned proposal (or the flagged original when no coin was available),
/// 422 with a stable rejection string, 503 on transient failure.
pub async fn submit_payjoin(
    State(state): State<ApiState>,
    Path(invoice_id): Path<String>,
    body: String,
) -> (StatusCode, Json<ApiResponse<PayjoinResponse>>) {
    let candidate: Transaction = match encode::deserialize_hex(body.trim()) {
        Ok(tx) => tx,
        Err(e) => {
            debug!("rejected undecodable payjoin body: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(format!("invalid transaction hex: {}", e))),
            );
        }
    };

    let id = InvoiceId(invoice_id);
    let min_fee_rate = state.app.fee_oracle.min_relay_rate().await;

    match state
        .app
        .negotiator
        .negotiate(&id, candidate, min_fee_rate)
        .await
    {
        Ok(Outcome::Payjoin(proposal)) => (
            StatusCode::OK,
            Json(ApiResponse::success(PayjoinResponse {
                transaction_hex: encode::serialize_hex(&proposal),
                payjoin: true,
                reason: None,
            })),
        ),
        Ok(Outcome::Original(original)) => (
            StatusCode::OK,
            Json(ApiResponse::success(PayjoinResponse {
                transaction_hex: encode::serialize_hex(&original),
                payjoin: false,
                reason: Some(Outcome::OUT_OF_UTXOS.to_string()),
            })),
        ),
        Err(e) => {
            let status = match &e {
                NegotiationError::Rejected(_) | NegotiationError::PayjoinNotEnabled => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                NegotiationError::UnknownInvoice(_) => StatusCode::NOT_FOUND,
                NegotiationError::InvalidCandidate(_) => StatusCode::BAD_REQUEST,
                NegotiationError::Coins(_) => StatusCode::SERVICE_UNAVAILABLE,
                NegotiationError::Accounting(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!(invoice = %id, "payjoin negotiation failed: {}", e);
            } else {
                warn!(invoice = %id, status = %status, "payjoin rejected: {}", e);
            }
            (status, Json(ApiResponse::error(e.to_string())))
        }
    }
}
