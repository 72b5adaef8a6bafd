//! Registration reconciler worker.
//!
//! Closes the gap between "the gateway took the money" and "the ILS knows
//! the fines are paid". Retries failed registrations on a schedule, expires
//! the ones that will never succeed, and emits rate-limited operator
//! reports for everything that needs a human. Coordinates with the web tier
//! purely through the transaction store: every mutation is a status-guarded
//! compare-and-swap, so concurrent passes and concurrent callbacks cannot
//! double-apply.

use crate::database::store::TransactionStore;
use crate::database::transaction::{Transaction, TransactionStatus};
use crate::ils::IlsConnector;
use crate::services::notification::{NotificationService, NotificationType};
use crate::services::orchestrator::patron_from_transaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often the worker wakes up
    pub poll_interval: Duration,
    /// How old a paid transaction must be before the worker touches it, so
    /// it never races the synchronous attempt in the callback path
    pub minimum_paid_age: Duration,
    /// Paid transactions older than this stop being retried and are expired
    /// for operator attention
    pub registration_max_age: Duration,
    /// Minimum time between operator reports for the same transaction
    pub report_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            minimum_paid_age: Duration::from_secs(120),
            registration_max_age: Duration::from_secs(72 * 3600),
            report_interval: Duration::from_secs(24 * 3600),
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.poll_interval = Duration::from_secs(
            std::env::var("RECONCILER_POLL_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.poll_interval.as_secs()),
        );
        cfg.minimum_paid_age = Duration::from_secs(
            std::env::var("RECONCILER_MINIMUM_PAID_AGE_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.minimum_paid_age.as_secs()),
        );
        cfg.registration_max_age = Duration::from_secs(
            std::env::var("RECONCILER_REGISTRATION_MAX_AGE_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.registration_max_age.as_secs()),
        );
        cfg.report_interval = Duration::from_secs(
            std::env::var("RECONCILER_REPORT_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.report_interval.as_secs()),
        );
        cfg
    }
}

/// Counters from one reconciliation pass, for logging and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerPassSummary {
    pub retried: usize,
    pub registered: usize,
    pub expired: usize,
    pub reported: usize,
}

pub struct RegistrationReconcilerWorker {
    store: Arc<dyn TransactionStore>,
    ils: Arc<dyn IlsConnector>,
    notifier: Arc<NotificationService>,
    config: ReconcilerConfig,
}

impl RegistrationReconcilerWorker {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        ils: Arc<dyn IlsConnector>,
        notifier: Arc<NotificationService>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            ils,
            notifier,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            minimum_paid_age_secs = self.config.minimum_paid_age.as_secs(),
            registration_max_age_secs = self.config.registration_max_age.as_secs(),
            report_interval_secs = self.config.report_interval.as_secs(),
            "registration reconciler worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("registration reconciler worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_cycle().await {
                        Ok(summary) => {
                            if summary != ReconcilerPassSummary::default() {
                                info!(
                                    retried = summary.retried,
                                    registered = summary.registered,
                                    expired = summary.expired,
                                    reported = summary.reported,
                                    "reconciler pass finished"
                                );
                            }
                        }
                        Err(e) => warn!(error = %e, "reconciler cycle failed"),
                    }
                }
            }
        }

        info!("registration reconciler worker stopped");
    }

    pub async fn run_cycle(&self) -> anyhow::Result<ReconcilerPassSummary> {
        let mut summary = self
            .retry_failed_registrations(self.config.minimum_paid_age)
            .await?;
        summary.reported = self.report_unresolved(self.config.report_interval).await?;
        Ok(summary)
    }

    /// Retry ILS registration for transactions stuck in `paid` or
    /// `registration_failed`, expiring the ones past the retry deadline.
    pub async fn retry_failed_registrations(
        &self,
        minimum_paid_age: Duration,
    ) -> anyhow::Result<ReconcilerPassSummary> {
        let candidates = self
            .store
            .find_registration_retry_candidates(minimum_paid_age)
            .await?;

        let mut summary = ReconcilerPassSummary::default();
        for tx in candidates {
            if registration_has_expired(tx.paid, self.config.registration_max_age) {
                if self.expire(&tx).await {
                    summary.expired += 1;
                }
                continue;
            }

            summary.retried += 1;
            if self.attempt_registration(&tx).await {
                summary.registered += 1;
            }
        }

        Ok(summary)
    }

    /// Emit operator reports for expired/flagged transactions whose last
    /// report is old enough, stamping `reported` so the reporting is
    /// rate-limited rather than repeated every pass.
    pub async fn report_unresolved(
        &self,
        minimum_report_interval: Duration,
    ) -> anyhow::Result<usize> {
        let unresolved = self
            .store
            .find_unresolved_for_reporting(minimum_report_interval)
            .await?;

        let mut reported = 0;
        for tx in unresolved {
            let notification_type = match tx.status() {
                Some(TransactionStatus::FinesUpdated) => NotificationType::FinesUpdated,
                _ => NotificationType::RegistrationExpired,
            };
            self.notifier.report_unresolved(&tx, notification_type).await;
            if self.store.stamp_reported(&tx.transaction_id).await? {
                reported += 1;
            }
        }
        Ok(reported)
    }

    async fn attempt_registration(&self, tx: &Transaction) -> bool {
        let patron = patron_from_transaction(tx);
        let fine_ids = match self.store.fees_for_transaction(&tx.transaction_id).await {
            Ok(fees) => fees.into_iter().map(|f| f.fine_reference).collect::<Vec<_>>(),
            Err(e) => {
                error!(
                    transaction_id = %tx.transaction_id,
                    error = %e,
                    "could not load fee snapshot for retry"
                );
                return false;
            }
        };

        let outcome = self
            .ils
            .mark_fees_as_paid(&patron, tx.amount, &tx.transaction_id, tx.id, &fine_ids)
            .await;

        match outcome {
            Ok(true) => match self.store.mark_registered(&tx.transaction_id).await {
                Ok(true) => {
                    info!(
                        transaction_id = %tx.transaction_id,
                        patron_id = %tx.patron_id,
                        "stuck registration completed on retry"
                    );
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    error!(
                        transaction_id = %tx.transaction_id,
                        error = %e,
                        "failed to record successful retry"
                    );
                    false
                }
            },
            Ok(false) => {
                self.record_failure(tx, "ILS refused fee registration").await;
                false
            }
            Err(e) => {
                self.record_failure(tx, &e.to_string()).await;
                false
            }
        }
    }

    async fn record_failure(&self, tx: &Transaction, message: &str) {
        warn!(
            transaction_id = %tx.transaction_id,
            error = %message,
            "registration retry failed"
        );
        if let Err(e) = self
            .store
            .mark_registration_failed(&tx.transaction_id, message)
            .await
        {
            error!(
                transaction_id = %tx.transaction_id,
                error = %e,
                "failed to record retry failure"
            );
        }
    }

    async fn expire(&self, tx: &Transaction) -> bool {
        // A row still in `paid` never had its failure recorded; move it to
        // `registration_failed` first so the expiry transition is legal.
        if tx.status() == Some(TransactionStatus::Paid) {
            let _ = self
                .store
                .mark_registration_failed(
                    &tx.transaction_id,
                    "registration never completed within the retry window",
                )
                .await;
        }

        match self.store.mark_registration_expired(&tx.transaction_id).await {
            Ok(true) => {
                warn!(
                    transaction_id = %tx.transaction_id,
                    patron_id = %tx.patron_id,
                    "registration retries exhausted, expiring for operator attention"
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(
                    transaction_id = %tx.transaction_id,
                    error = %e,
                    "failed to expire transaction"
                );
                false
            }
        }
    }
}

/// True when `paid` is older than `max_age`; such transactions are expired
/// instead of retried.
fn registration_has_expired(
    paid: Option<chrono::DateTime<chrono::Utc>>,
    max_age: Duration,
) -> bool {
    let Some(paid) = paid else {
        return false;
    };
    let elapsed = chrono::Utc::now() - paid;
    elapsed.to_std().map(|d| d > max_age).unwrap_or(false)
}
