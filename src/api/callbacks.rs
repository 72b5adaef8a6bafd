//! Gateway callback endpoints.
//!
//! Two channels deliver the payment outcome: "return" (the user agent being
//! redirected back) and "notify" (the gateway posting asynchronously). Both
//! run through the same orchestrator path; whichever arrives second is a
//! no-op. The provider always gets a generic acknowledgment so a forged or
//! malformed callback learns nothing and a genuine one is never retried
//! forever, while state only changes after signature verification.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::api::payments::PaymentApiState;
use crate::payments::types::{CallbackRequest, GatewayName};
use crate::services::orchestrator::CallbackAck;

/// User-facing outcome hint for the return channel.
fn outcome_hint(ack: CallbackAck) -> &'static str {
    match ack {
        // Registration failures are invisible: the charge went through.
        CallbackAck::PaymentRegistered | CallbackAck::PaymentTakenRegistrationPending => {
            "success"
        }
        CallbackAck::PaymentCancelled => "cancelled",
        CallbackAck::PaymentFailed => "failed",
        CallbackAck::AlreadyHandled => "success",
        CallbackAck::Discarded => "unknown",
    }
}

fn build_callback_request(params: HashMap<String, String>, body: String) -> CallbackRequest {
    let json = if body.trim().is_empty() {
        None
    } else {
        match serde_json::from_str::<JsonValue>(&body) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("non-JSON callback body ignored");
                None
            }
        }
    };
    CallbackRequest { params, json }
}

async fn process(
    state: &PaymentApiState,
    gateway: &str,
    params: HashMap<String, String>,
    body: String,
    channel: &'static str,
) -> (StatusCode, Json<serde_json::Value>) {
    let Ok(gateway) = GatewayName::from_str(gateway) else {
        warn!(gateway = %gateway, "callback for unknown gateway");
        return (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok", "result": "unknown"})),
        );
    };

    let request = build_callback_request(params, body);
    match state.orchestrator.handle_callback(gateway, &request).await {
        Ok(ack) => {
            info!(gateway = %gateway, channel = channel, ack = ?ack, "callback processed");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "ok",
                    "result": outcome_hint(ack),
                })),
            )
        }
        Err(e) => {
            // Internal failure: let the provider retry the notify channel.
            error!(gateway = %gateway, channel = channel, error = %e, "callback processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"status": "error"})),
            )
        }
    }
}

/// GET/POST /api/payments/callback/:gateway/return
pub async fn handle_return(
    State(state): State<Arc<PaymentApiState>>,
    Path(gateway): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> impl IntoResponse {
    process(&state, &gateway, params, body, "return").await
}

/// GET/POST /api/payments/callback/:gateway/notify
pub async fn handle_notify(
    State(state): State<Arc<PaymentApiState>>,
    Path(gateway): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> impl IntoResponse {
    process(&state, &gateway, params, body, "notify").await
}
