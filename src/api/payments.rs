//! Fines preview and payment start endpoints.
//!
//! Authentication lives in front of this service; handlers trust the patron
//! identity in the request body and only guard the payment flow itself.

use axum::{extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::AppError;
use crate::ils::PatronAccount;
use crate::logging::mask_patron_id;
use crate::middleware::error::success_response;
use crate::payments::types::RedirectInstruction;
use crate::services::fingerprint::PaymentFingerprint;
use crate::services::orchestrator::PaymentOrchestrator;

pub struct PaymentApiState {
    pub orchestrator: Arc<PaymentOrchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub patron: PatronAccount,
    #[serde(default)]
    pub selected_fine_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub payable: bool,
    pub amount: i64,
    pub transaction_fee: i64,
    pub total: i64,
    pub currency: String,
    pub fines: Vec<crate::ils::Fine>,
    pub reason: Option<String>,
    /// Hand this back unchanged when starting the payment
    pub fingerprint: PaymentFingerprint,
}

/// POST /api/fines/preview
pub async fn preview_fines(
    State(state): State<Arc<PaymentApiState>>,
    Json(request): Json<PreviewRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (check, fingerprint) = state
        .orchestrator
        .preview(&request.patron, &request.selected_fine_ids)
        .await?;

    let config = state.orchestrator.config();
    let transaction_fee = if check.amount > 0 {
        config.transaction_fee
    } else {
        0
    };

    info!(
        patron_id = %mask_patron_id(&request.patron.patron_id),
        payable = check.payable,
        amount = check.amount,
        "fines preview served"
    );

    Ok(success_response(PreviewResponse {
        payable: check.payable && check.amount > 0,
        amount: check.amount,
        transaction_fee,
        total: check.amount + transaction_fee,
        currency: config.currency.clone(),
        fines: check.fines,
        reason: check.reason,
        fingerprint,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StartPaymentBody {
    pub patron: PatronAccount,
    #[serde(default)]
    pub selected_fine_ids: Vec<String>,
    /// The fingerprint returned by the preview endpoint
    pub fingerprint: PaymentFingerprint,
}

#[derive(Debug, Serialize)]
pub struct StartPaymentResponse {
    pub redirect: RedirectInstruction,
}

/// POST /api/payments
pub async fn start_payment(
    State(state): State<Arc<PaymentApiState>>,
    Json(body): Json<StartPaymentBody>,
) -> Result<impl IntoResponse, AppError> {
    let redirect = state
        .orchestrator
        .start(&body.patron, &body.selected_fine_ids, &body.fingerprint)
        .await?;

    info!(
        patron_id = %mask_patron_id(&body.patron.patron_id),
        "payment started, redirecting to gateway"
    );

    Ok(success_response(StartPaymentResponse { redirect }))
}
