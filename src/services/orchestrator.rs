//! Payment orchestrator.
//!
//! Sequences guard → fingerprint → gateway → store on the start path, and
//! gateway validation → store transition → ILS registration on the callback
//! path. The store is only written after the gateway accepted a request, and
//! a callback only mutates state after its signature checked out and the
//! compare-and-swap out of `progress` won.

use crate::database::store::{NewFeeLineItem, NewTransaction, TransactionStore};
use crate::database::transaction::{Transaction, TransactionStatus};
use crate::error::{AppError, AppErrorKind, DomainError, ExternalError};
use crate::ils::{Fine, IlsConnector, PatronAccount};
use crate::payments::gateway::GatewayAdapter;
use crate::payments::types::{
    CallbackOutcome, CallbackRequest, FineSnapshot, GatewayName, PayerInfo, RedirectInstruction,
};
use crate::payments::utils::add_query_param;
use crate::services::fingerprint::{self, PaymentFingerprint};
use crate::services::payment_guard::{PaymentGuard, PermitDecision};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Query parameter carrying the correlation key through gateway redirects.
pub const TRANSACTION_ID_PARAM: &str = "payment_id";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Age after which an abandoned in-progress transaction stops blocking
    pub stale_after: Duration,
    /// Service charge added on top of the fines, minor units
    pub transaction_fee: i64,
    /// Smallest payable total accepted, minor units
    pub minimum_payment: i64,
    pub currency: String,
    /// Where the gateway sends the user agent back
    pub return_base_url: String,
    /// Where the gateway posts the asynchronous notification
    pub notify_base_url: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30 * 60),
            transaction_fee: 0,
            minimum_payment: 0,
            currency: "EUR".to_string(),
            return_base_url: "http://localhost:8000/api/payments/callback/cpu/return"
                .to_string(),
            notify_base_url: "http://localhost:8000/api/payments/callback/cpu/notify"
                .to_string(),
        }
    }
}

/// How an inbound callback was disposed of. Every variant is acknowledged
/// with a generic 200 to the provider; the variant only drives logging and
/// the user-facing redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAck {
    /// Charge confirmed and fees registered in the ILS
    PaymentRegistered,
    /// Charge confirmed; registration failed and was handed to the reconciler
    PaymentTakenRegistrationPending,
    PaymentCancelled,
    PaymentFailed,
    /// Transaction was no longer in progress; duplicate delivery
    AlreadyHandled,
    /// Unknown correlation id, missing field, or bad signature; no mutation
    Discarded,
}

pub struct PaymentOrchestrator {
    gateways: HashMap<GatewayName, Arc<dyn GatewayAdapter>>,
    driver_gateways: HashMap<String, GatewayName>,
    default_gateway: GatewayName,
    store: Arc<dyn TransactionStore>,
    guard: Arc<PaymentGuard>,
    ils: Arc<dyn IlsConnector>,
    config: OrchestratorConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        gateways: Vec<Arc<dyn GatewayAdapter>>,
        driver_gateways: HashMap<String, GatewayName>,
        default_gateway: GatewayName,
        store: Arc<dyn TransactionStore>,
        guard: Arc<PaymentGuard>,
        ils: Arc<dyn IlsConnector>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            gateways: gateways.into_iter().map(|g| (g.name(), g)).collect(),
            driver_gateways,
            default_gateway,
            store,
            guard,
            ils,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    pub fn gateway_for_driver(&self, driver: &str) -> GatewayName {
        self.driver_gateways
            .get(driver)
            .copied()
            .unwrap_or(self.default_gateway)
    }

    fn adapter(&self, name: GatewayName) -> Result<&Arc<dyn GatewayAdapter>, AppError> {
        self.gateways.get(&name).ok_or_else(|| {
            AppError::new(AppErrorKind::External(ExternalError::PaymentGateway {
                gateway: name.to_string(),
                message: "gateway not configured".to_string(),
                is_retryable: false,
            }))
        })
    }

    /// What the patron would pay right now, for rendering the fines page.
    /// The returned fingerprint must be handed back on submit.
    pub async fn preview(
        &self,
        patron: &PatronAccount,
        selected_fine_ids: &[String],
    ) -> Result<(crate::ils::PayableCheck, PaymentFingerprint), AppError> {
        let check = self.ils.get_payable_fines(patron, selected_fine_ids).await?;
        let print = fingerprint::snapshot(patron, check.amount);
        Ok((check, print))
    }

    /// Start a payment: guard, fingerprint, gateway, then persist. Nothing
    /// is persisted unless the gateway accepted the request.
    pub async fn start(
        &self,
        patron: &PatronAccount,
        selected_fine_ids: &[String],
        stored_fingerprint: &PaymentFingerprint,
    ) -> Result<RedirectInstruction, AppError> {
        // Serialize guard-check + persist per patron so two simultaneous
        // starts cannot both pass the guard.
        let lock = self.guard.patron_lock(&patron.patron_id).await;
        let _held = lock.lock().await;

        match self
            .guard
            .is_payment_permitted(&patron.patron_id, self.config.stale_after)
            .await?
        {
            PermitDecision::Permitted => {}
            PermitDecision::Denied(reason) => {
                info!(
                    patron_id = %patron.patron_id,
                    reason = reason.message_key(),
                    "payment not permitted"
                );
                let err = match reason {
                    crate::services::payment_guard::DenialReason::InProgress => {
                        DomainError::PaymentInProgress {
                            patron_id: patron.patron_id.clone(),
                        }
                    }
                    crate::services::payment_guard::DenialReason::PriorUnresolved => {
                        DomainError::PriorPaymentUnresolved {
                            patron_id: patron.patron_id.clone(),
                        }
                    }
                };
                return Err(AppError::new(AppErrorKind::Domain(err)));
            }
        }

        let check = self.ils.get_payable_fines(patron, selected_fine_ids).await?;
        if !check.payable || check.amount <= 0 {
            return Err(AppError::new(AppErrorKind::Domain(
                DomainError::FinesNotPayable {
                    reason: check
                        .reason
                        .unwrap_or_else(|| "no payable fines".to_string()),
                },
            )));
        }

        // The fingerprint check runs even though the guard passed: the guard
        // protects against concurrent payments, the fingerprint against a
        // stale display.
        if fingerprint::has_changed(stored_fingerprint, patron, check.amount) {
            return Err(AppError::new(AppErrorKind::Domain(
                DomainError::FinesChanged {
                    patron_id: patron.patron_id.clone(),
                },
            )));
        }

        if check.amount < self.config.minimum_payment {
            return Err(AppError::new(AppErrorKind::Domain(
                DomainError::FinesNotPayable {
                    reason: "total is below the online payment minimum".to_string(),
                },
            )));
        }

        let transaction_id = generate_transaction_id(&patron.patron_id);
        let return_url = add_query_param(
            &self.config.return_base_url,
            TRANSACTION_ID_PARAM,
            &transaction_id,
        );
        let notify_url = add_query_param(
            &self.config.notify_base_url,
            TRANSACTION_ID_PARAM,
            &transaction_id,
        );

        let gateway_name = self.gateway_for_driver(&patron.driver);
        let adapter = self.adapter(gateway_name)?;

        let redirect = adapter
            .start_payment(crate::payments::types::StartPaymentRequest {
                transaction_id: transaction_id.clone(),
                return_url,
                notify_url,
                payer: PayerInfo {
                    email: patron.email.clone(),
                    firstname: patron.firstname.clone(),
                    lastname: patron.lastname.clone(),
                    language: patron.language.clone(),
                },
                fines: check.fines.iter().map(fine_snapshot).collect(),
                transaction_fee: self.config.transaction_fee,
                currency: self.config.currency.clone(),
            })
            .await
            .map_err(|e| {
                error!(
                    patron_id = %patron.patron_id,
                    gateway = %gateway_name,
                    error = %e,
                    "gateway rejected payment start"
                );
                AppError::from(e)
            })?;

        // Persist only after the gateway accepted the request.
        let created = self
            .store
            .create_transaction(
                NewTransaction {
                    transaction_id: transaction_id.clone(),
                    driver: patron.driver.clone(),
                    user_id: patron.user_id.clone(),
                    patron_id: patron.patron_id.clone(),
                    amount: check.amount,
                    transaction_fee: self.config.transaction_fee,
                    currency: self.config.currency.clone(),
                },
                check.fines.iter().map(fee_line_item).collect(),
            )
            .await;

        match created {
            Ok(transaction) => {
                info!(
                    transaction_id = %transaction.transaction_id,
                    patron_id = %patron.patron_id,
                    amount = transaction.amount,
                    transaction_fee = transaction.transaction_fee,
                    gateway = %gateway_name,
                    "payment started"
                );
                Ok(redirect)
            }
            Err(e) if e.is_unique_violation() => Err(AppError::new(AppErrorKind::Domain(
                DomainError::DuplicateTransaction { transaction_id },
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Process a gateway callback (return or notify channel; both land
    /// here). Never mutates state for unknown ids, bad signatures, or
    /// transactions that already left `progress`.
    pub async fn handle_callback(
        &self,
        gateway: GatewayName,
        request: &CallbackRequest,
    ) -> Result<CallbackAck, AppError> {
        // Only the correlation id is read before signature verification.
        let Some(transaction_id) = request
            .field(TRANSACTION_ID_PARAM)
            .filter(|v| !v.is_empty())
        else {
            warn!(gateway = %gateway, "callback without correlation id discarded");
            return Ok(CallbackAck::Discarded);
        };

        let Some(transaction) = self.store.find_by_transaction_id(&transaction_id).await? else {
            warn!(
                gateway = %gateway,
                transaction_id = %transaction_id,
                "callback for unknown transaction discarded"
            );
            return Ok(CallbackAck::Discarded);
        };

        if transaction.status() != Some(TransactionStatus::Progress) {
            info!(
                transaction_id = %transaction_id,
                status = %transaction.status,
                "callback for already-processed transaction acknowledged"
            );
            return Ok(CallbackAck::AlreadyHandled);
        }

        let adapter = self.adapter(gateway)?;
        let validated = match adapter.validate_callback(request) {
            Ok(validated) => validated,
            Err(e) => {
                warn!(
                    gateway = %gateway,
                    transaction_id = %transaction_id,
                    error = %e,
                    "callback validation failed, discarding"
                );
                return Ok(CallbackAck::Discarded);
            }
        };

        if validated.transaction_id != transaction_id {
            warn!(
                gateway = %gateway,
                correlation_id = %transaction_id,
                signed_id = %validated.transaction_id,
                "callback id mismatch, discarding"
            );
            return Ok(CallbackAck::Discarded);
        }

        match validated.outcome {
            CallbackOutcome::Success => {
                if !self.store.mark_paid(&transaction_id).await? {
                    // Lost the race against the other callback channel.
                    return Ok(CallbackAck::AlreadyHandled);
                }
                info!(
                    transaction_id = %transaction_id,
                    provider_reference = %validated.provider_reference,
                    "payment confirmed by gateway"
                );

                // One synchronous registration attempt; a failure is handed
                // to the reconciler instead of blocking the response.
                if self.register_payment(&transaction).await {
                    Ok(CallbackAck::PaymentRegistered)
                } else {
                    Ok(CallbackAck::PaymentTakenRegistrationPending)
                }
            }
            CallbackOutcome::Cancelled => {
                if !self.store.mark_cancelled(&transaction_id).await? {
                    return Ok(CallbackAck::AlreadyHandled);
                }
                info!(transaction_id = %transaction_id, "payment cancelled by user");
                Ok(CallbackAck::PaymentCancelled)
            }
            CallbackOutcome::Failed { reason } => {
                if !self.store.mark_payment_failed(&transaction_id, &reason).await? {
                    return Ok(CallbackAck::AlreadyHandled);
                }
                warn!(
                    transaction_id = %transaction_id,
                    reason = %reason,
                    "payment failed at gateway"
                );
                Ok(CallbackAck::PaymentFailed)
            }
        }
    }

    /// Register a paid transaction in the ILS. Returns true when the
    /// transaction reached `complete`.
    pub async fn register_payment(&self, transaction: &Transaction) -> bool {
        let patron = patron_from_transaction(transaction);
        let fine_ids = match self
            .store
            .fees_for_transaction(&transaction.transaction_id)
            .await
        {
            Ok(fees) => fees.into_iter().map(|f| f.fine_reference).collect::<Vec<_>>(),
            Err(e) => {
                error!(
                    transaction_id = %transaction.transaction_id,
                    error = %e,
                    "could not load fee snapshot for registration"
                );
                let _ = self
                    .store
                    .mark_registration_failed(&transaction.transaction_id, &e.to_string())
                    .await;
                return false;
            }
        };

        let result = self
            .ils
            .mark_fees_as_paid(
                &patron,
                transaction.amount,
                &transaction.transaction_id,
                transaction.id,
                &fine_ids,
            )
            .await;

        match result {
            Ok(true) => match self.store.mark_registered(&transaction.transaction_id).await {
                Ok(true) => {
                    info!(
                        transaction_id = %transaction.transaction_id,
                        "fees registered as paid"
                    );
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    error!(
                        transaction_id = %transaction.transaction_id,
                        error = %e,
                        "failed to record successful registration"
                    );
                    false
                }
            },
            Ok(false) => {
                self.record_registration_failure(
                    &transaction.transaction_id,
                    "ILS refused fee registration",
                )
                .await;
                false
            }
            Err(e) => {
                self.record_registration_failure(&transaction.transaction_id, &e.to_string())
                    .await;
                false
            }
        }
    }

    async fn record_registration_failure(&self, transaction_id: &str, message: &str) {
        warn!(
            transaction_id = %transaction_id,
            error = %message,
            "fee registration failed, deferring to reconciler"
        );
        if let Err(e) = self
            .store
            .mark_registration_failed(transaction_id, message)
            .await
        {
            error!(
                transaction_id = %transaction_id,
                error = %e,
                "failed to record registration failure"
            );
        }
    }
}

/// Rebuild the minimal patron identity the ILS needs from the audit row.
pub fn patron_from_transaction(transaction: &Transaction) -> PatronAccount {
    PatronAccount {
        driver: transaction.driver.clone(),
        patron_id: transaction.patron_id.clone(),
        user_id: transaction.user_id.clone(),
        email: None,
        firstname: None,
        lastname: None,
        language: None,
    }
}

fn fine_snapshot(fine: &Fine) -> FineSnapshot {
    FineSnapshot {
        fine_reference: fine.fine_reference.clone(),
        fine_type: fine.fine_type.clone(),
        title: fine.title.clone(),
        organization: fine.organization.clone(),
        amount: fine.balance,
    }
}

fn fee_line_item(fine: &Fine) -> NewFeeLineItem {
    NewFeeLineItem {
        amount: fine.balance,
        currency: fine.currency.clone(),
        description: fine.title.clone().unwrap_or_default(),
        fine_reference: fine.fine_reference.clone(),
        fine_type: fine.fine_type.clone(),
        organization: fine.organization.clone(),
    }
}

/// Unguessable correlation key: patron id, nanosecond timestamp and a
/// random nonce, hashed.
pub fn generate_transaction_id(patron_id: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let raw = format!("{}_{}_{}", patron_id, nanos, Uuid::new_v4());
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}
