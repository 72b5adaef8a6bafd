//! Operator actions on stuck transactions.
//!
//! These endpoints back the manual half of reconciliation: flagging a
//! transaction whose fines changed underneath it, and closing one an
//! operator fixed by hand. Both are status-guarded in the store, so acting
//! on a row that moved on in the meantime is refused, not applied.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::info;

use crate::api::payments::PaymentApiState;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::middleware::error::success_response;

/// POST /api/admin/transactions/{transaction_id}/resolve
pub async fn resolve_transaction(
    State(state): State<Arc<PaymentApiState>>,
    Path(transaction_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let store = state.orchestrator.store();
    if store.find_by_transaction_id(&transaction_id).await?.is_none() {
        return Err(AppError::new(AppErrorKind::Domain(
            DomainError::TransactionNotFound { transaction_id },
        )));
    }

    let applied = store.mark_registration_resolved(&transaction_id).await?;
    if !applied {
        return Err(AppError::new(AppErrorKind::Domain(
            DomainError::InvalidTransactionState {
                transaction_id,
                action: "operator resolution".to_string(),
            },
        )));
    }

    info!(transaction_id = %transaction_id, "transaction resolved by operator");
    Ok(success_response(serde_json::json!({
        "transaction_id": transaction_id,
        "status": "registration_resolved",
    })))
}

/// POST /api/admin/transactions/{transaction_id}/flag-fines-updated
pub async fn flag_fines_updated(
    State(state): State<Arc<PaymentApiState>>,
    Path(transaction_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let store = state.orchestrator.store();
    if store.find_by_transaction_id(&transaction_id).await?.is_none() {
        return Err(AppError::new(AppErrorKind::Domain(
            DomainError::TransactionNotFound { transaction_id },
        )));
    }

    let applied = store.flag_fines_updated(&transaction_id).await?;
    if !applied {
        return Err(AppError::new(AppErrorKind::Domain(
            DomainError::InvalidTransactionState {
                transaction_id,
                action: "flagging changed fines".to_string(),
            },
        )));
    }

    info!(transaction_id = %transaction_id, "transaction flagged: fines updated");
    Ok(success_response(serde_json::json!({
        "transaction_id": transaction_id,
        "status": "fines_updated",
    })))
}
