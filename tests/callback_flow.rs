//! End-to-end payment lifecycle tests against the in-memory store, the
//! scripted ILS and a gateway mock that verifies real signatures.

mod common;

use common::*;
use patronpay_backend::database::store::TransactionStore;
use patronpay_backend::database::transaction::TransactionStatus;
use patronpay_backend::error::{AppErrorKind, DomainError};
use patronpay_backend::services::fingerprint;
use patronpay_backend::services::orchestrator::CallbackAck;
use patronpay_backend::payments::types::GatewayName;
use patronpay_backend::workers::registration_reconciler::{
    ReconcilerConfig, RegistrationReconcilerWorker,
};
use patronpay_backend::services::notification::NotificationService;
use std::sync::Arc;
use std::time::Duration;

/// The worked example: fines of 550 with a 50 fee, a successful charge, a
/// failing synchronous registration, and a reconciler retry that succeeds
/// three minutes later.
#[tokio::test]
async fn full_lifecycle_with_deferred_registration() {
    let h = harness(550, 50);
    let print = fingerprint::snapshot(&patron(), 550);

    let redirect = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect("start should succeed");
    let tx_id = transaction_id_from_redirect(&redirect);

    let tx = h.store.get(&tx_id).await.expect("row persisted");
    assert_eq!(tx.status(), Some(TransactionStatus::Progress));
    assert_eq!(tx.amount, 550);
    assert_eq!(tx.transaction_fee, 50);
    assert_eq!(tx.total_amount(), 600);

    let fees = h
        .store
        .fees_for_transaction(&tx_id)
        .await
        .expect("fee query");
    assert_eq!(fees.len(), 1);
    assert_eq!(fees[0].amount, 550);
    assert_eq!(fees[0].fine_reference, "fine_1");

    // Gateway confirms the charge, but the ILS is down.
    h.ils.set_register_ok(false);
    let ack = h
        .orchestrator
        .handle_callback(GatewayName::Cpu, &signed_callback(&tx_id, 1))
        .await
        .expect("callback should be handled");
    assert_eq!(ack, CallbackAck::PaymentTakenRegistrationPending);

    let tx = h.store.get(&tx_id).await.expect("row exists");
    assert_eq!(tx.status(), Some(TransactionStatus::RegistrationFailed));
    assert!(tx.paid.is_some());
    assert!(tx.error_message.is_some());

    // Three minutes later the ILS is back.
    h.store
        .backdate(
            &tx_id,
            None,
            Some(chrono::Utc::now() - chrono::Duration::minutes(3)),
        )
        .await;
    h.ils.set_register_ok(true);

    let worker = RegistrationReconcilerWorker::new(
        Arc::clone(&h.store) as Arc<dyn TransactionStore>,
        Arc::clone(&h.ils) as Arc<dyn patronpay_backend::ils::IlsConnector>,
        Arc::new(NotificationService::new()),
        ReconcilerConfig::default(),
    );
    let summary = worker
        .retry_failed_registrations(Duration::from_secs(120))
        .await
        .expect("reconciler pass");
    assert_eq!(summary.registered, 1);

    let tx = h.store.get(&tx_id).await.expect("row exists");
    assert_eq!(tx.status(), Some(TransactionStatus::Complete));
    assert!(tx.registered.is_some());

    // Completed transactions are invisible to the next pass.
    let summary = worker
        .retry_failed_registrations(Duration::from_secs(120))
        .await
        .expect("reconciler pass");
    assert_eq!(summary.retried, 0);
}

#[tokio::test]
async fn duplicate_success_callback_is_a_no_op() {
    let h = harness(550, 0);
    let print = fingerprint::snapshot(&patron(), 550);
    let redirect = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect("start should succeed");
    let tx_id = transaction_id_from_redirect(&redirect);

    let callback = signed_callback(&tx_id, 1);
    let first = h
        .orchestrator
        .handle_callback(GatewayName::Cpu, &callback)
        .await
        .expect("first delivery");
    assert_eq!(first, CallbackAck::PaymentRegistered);

    // The notify channel delivers the same outcome again.
    let second = h
        .orchestrator
        .handle_callback(GatewayName::Cpu, &callback)
        .await
        .expect("second delivery");
    assert_eq!(second, CallbackAck::AlreadyHandled);

    // Exactly one registration happened.
    assert_eq!(h.ils.register_calls(), 1);
    let tx = h.store.get(&tx_id).await.expect("row exists");
    assert_eq!(tx.status(), Some(TransactionStatus::Complete));
}

#[tokio::test]
async fn tampered_callback_produces_no_transition() {
    let h = harness(550, 0);
    let print = fingerprint::snapshot(&patron(), 550);
    let redirect = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect("start should succeed");
    let tx_id = transaction_id_from_redirect(&redirect);

    // Signed as cancelled, status flipped to success afterwards.
    let mut callback = signed_callback(&tx_id, 0);
    callback.params.insert("Status".to_string(), "1".to_string());

    let ack = h
        .orchestrator
        .handle_callback(GatewayName::Cpu, &callback)
        .await
        .expect("callback handled");
    assert_eq!(ack, CallbackAck::Discarded);

    let tx = h.store.get(&tx_id).await.expect("row exists");
    assert_eq!(tx.status(), Some(TransactionStatus::Progress));
    assert_eq!(h.ils.register_calls(), 0);
}

#[tokio::test]
async fn unknown_correlation_id_is_discarded() {
    let h = harness(550, 0);
    let ack = h
        .orchestrator
        .handle_callback(GatewayName::Cpu, &signed_callback("deadbeef", 1))
        .await
        .expect("callback handled");
    assert_eq!(ack, CallbackAck::Discarded);
    assert_eq!(h.store.count().await, 0);
}

#[tokio::test]
async fn fingerprint_mismatch_blocks_start_and_persists_nothing() {
    let h = harness(550, 0);
    // Fingerprint captured when the total was 550; a fine was waived since.
    let stale = fingerprint::snapshot(&patron(), 550);
    h.ils.set_payable_amount(300).await;

    let err = h
        .orchestrator
        .start(&patron(), &[], &stale)
        .await
        .expect_err("stale fingerprint must abort");
    assert!(matches!(
        err.kind,
        AppErrorKind::Domain(DomainError::FinesChanged { .. })
    ));
    assert_eq!(h.store.count().await, 0);
}

#[tokio::test]
async fn concurrent_starts_leave_one_in_flight_transaction() {
    let h = harness(550, 0);
    let p = patron();
    let print = fingerprint::snapshot(&p, 550);

    let (a, b) = tokio::join!(
        h.orchestrator.start(&p, &[], &print),
        h.orchestrator.start(&p, &[], &print),
    );

    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one start may win");

    let failure = if a.is_err() { a } else { b };
    assert!(matches!(
        failure.expect_err("one start must lose").kind,
        AppErrorKind::Domain(DomainError::PaymentInProgress { .. })
    ));
    assert_eq!(h.store.count().await, 1);
}

#[tokio::test]
async fn unresolved_paid_transaction_blocks_further_payment() {
    let h = harness(550, 0);
    let print = fingerprint::snapshot(&patron(), 550);
    let redirect = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect("start should succeed");
    let tx_id = transaction_id_from_redirect(&redirect);

    h.ils.set_register_ok(false);
    h.orchestrator
        .handle_callback(GatewayName::Cpu, &signed_callback(&tx_id, 1))
        .await
        .expect("callback handled");

    // Even if the row is ancient, money was taken: the patron stays blocked.
    h.store
        .backdate(
            &tx_id,
            Some(chrono::Utc::now() - chrono::Duration::days(7)),
            Some(chrono::Utc::now() - chrono::Duration::days(7)),
        )
        .await;

    let err = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect_err("unresolved payment must block");
    assert!(matches!(
        err.kind,
        AppErrorKind::Domain(DomainError::PriorPaymentUnresolved { .. })
    ));
}

#[tokio::test]
async fn cancelled_payment_frees_the_patron() {
    let h = harness(550, 0);
    let print = fingerprint::snapshot(&patron(), 550);
    let redirect = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect("start should succeed");
    let tx_id = transaction_id_from_redirect(&redirect);

    let ack = h
        .orchestrator
        .handle_callback(GatewayName::Cpu, &signed_callback(&tx_id, 0))
        .await
        .expect("callback handled");
    assert_eq!(ack, CallbackAck::PaymentCancelled);

    let tx = h.store.get(&tx_id).await.expect("row exists");
    assert_eq!(tx.status(), Some(TransactionStatus::Cancelled));

    // Cancellation is terminal and non-blocking: a new payment may start.
    let redirect = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect("second start should succeed");
    assert_ne!(transaction_id_from_redirect(&redirect), tx_id);
}

#[tokio::test]
async fn abandoned_payment_stops_blocking_after_stale_window() {
    let h = harness(550, 0);
    let print = fingerprint::snapshot(&patron(), 550);
    let redirect = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect("start should succeed");
    let tx_id = transaction_id_from_redirect(&redirect);

    // While fresh, the in-progress row blocks.
    let err = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect_err("fresh in-progress row must block");
    assert!(matches!(
        err.kind,
        AppErrorKind::Domain(DomainError::PaymentInProgress { .. })
    ));

    // The user closed the tab an hour ago; the soft lock has expired.
    h.store
        .backdate(
            &tx_id,
            Some(chrono::Utc::now() - chrono::Duration::hours(1)),
            None,
        )
        .await;

    h.orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect("stale in-progress row must not block");
    assert_eq!(h.store.count().await, 2);

    // The abandoned row is retained as an audit record, never deleted.
    let abandoned = h.store.get(&tx_id).await.expect("row exists");
    assert_eq!(abandoned.status(), Some(TransactionStatus::Progress));
}

#[tokio::test]
async fn gateway_rejection_persists_nothing() {
    let h = harness(550, 0);
    let print = fingerprint::snapshot(&patron(), 550);
    h.gateway
        .fail_start
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect_err("gateway rejection must fail the start");
    assert!(matches!(err.kind, AppErrorKind::External(_)));
    assert_eq!(h.store.count().await, 0);

    // Nothing persisted means the user can simply retry.
    h.gateway
        .fail_start
        .store(false, std::sync::atomic::Ordering::SeqCst);
    h.orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect("retry after gateway rejection should succeed");
}

#[tokio::test]
async fn failed_payment_callback_records_the_reason() {
    let h = harness(550, 0);
    let print = fingerprint::snapshot(&patron(), 550);
    let redirect = h
        .orchestrator
        .start(&patron(), &[], &print)
        .await
        .expect("start should succeed");
    let tx_id = transaction_id_from_redirect(&redirect);

    let ack = h
        .orchestrator
        .handle_callback(GatewayName::Cpu, &signed_callback(&tx_id, 98))
        .await
        .expect("callback handled");
    assert_eq!(ack, CallbackAck::PaymentFailed);

    let tx = h.store.get(&tx_id).await.expect("row exists");
    assert_eq!(tx.status(), Some(TransactionStatus::PaymentFailed));
    assert!(tx.error_message.is_some());
    assert!(tx.paid.is_none());
}
