//! Invoice accounting endpoints

use super::{ApiResponse, ApiState};
use crate::accounting::{calculate, Snapshot};
use crate::invoice::InvoiceId;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::error;

/// Accounting snapshot for one payment method
#[derive(Debug, Serialize)]
pub struct MethodSnapshot {
    /// Stable method key, e.g. "BTC" or "BTC-offchain"
    pub method: String,
    /// The calculated snapshot
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

/// Invoice status response
#[derive(Debug, Serialize)]
pub struct InvoiceStatusResponse {
    /// Invoice identifier
    pub invoice_id: String,
    /// Fiat price
    pub price: Decimal,
    /// Quote currency
    pub currency: String,
    /// Current payment tolerance (percent)
    pub payment_tolerance: Decimal,
    /// One snapshot per enabled payment method
    pub methods: Vec<MethodSnapshot>,
}

/// Get the accounting snapshot of an invoice, one entry per payment method
pub async fn get_invoice_snapshot(
    State(state): State<ApiState>,
    Path(invoice_id): Path<String>,
) -> (StatusCode, Json<ApiResponse<InvoiceStatusResponse>>) {
    let id = InvoiceId(invoice_id);
    let Some(invoice) = state.app.invoices.get(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("unknown invoice: {}", id))),
        );
    };

    let payments = invoice.ledger.snapshot();
    let mut methods = Vec::with_capacity(invoice.terms.methods.len());
    for method in &invoice.terms.methods {
        match calculate(&payments, &invoice.terms, method) {
            Ok(snapshot) => methods.push(MethodSnapshot {
                method: method.id().to_string(),
                snapshot,
            }),
            Err(e) => {
                error!(invoice = %id, method = %method.id(), "accounting failed: {}", e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiResponse::error(format!("accounting failed: {}", e))),
                );
            }
        }
    }

    let response = InvoiceStatusResponse {
        invoice_id: id.0,
        price: invoice.terms.price,
        currency: invoice.terms.currency.clone(),
        payment_tolerance: invoice.terms.payment_tolerance,
        methods,
    };
    (StatusCode::OK, Json(ApiResponse::success(response)))
}
