//! Transaction store port.
//!
//! Every mutation that moves a row out of a status is compare-and-swap on
//! the expected current status and reports whether it actually applied.
//! Callers use the `false` return to detect duplicate callbacks and
//! concurrent reconciler passes without ever re-reading first.

use crate::database::error::DatabaseError;
use crate::database::transaction::{FeeLineItem, Transaction};
use async_trait::async_trait;
use std::time::Duration;

/// Input for creating a transaction row.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub transaction_id: String,
    pub driver: String,
    pub user_id: String,
    pub patron_id: String,
    pub amount: i64,
    pub transaction_fee: i64,
    pub currency: String,
}

/// Input for one fee line item snapshot.
#[derive(Debug, Clone)]
pub struct NewFeeLineItem {
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub fine_reference: String,
    pub fine_type: String,
    pub organization: Option<String>,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persist a transaction in `progress` together with its fee snapshot,
    /// atomically. Either everything is written or nothing is.
    async fn create_transaction(
        &self,
        new: NewTransaction,
        fees: Vec<NewFeeLineItem>,
    ) -> Result<Transaction, DatabaseError>;

    async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, DatabaseError>;

    async fn fees_for_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<FeeLineItem>, DatabaseError>;

    /// `progress` → `paid`, stamping `paid = now`. Returns false if the row
    /// was no longer in `progress`.
    async fn mark_paid(&self, transaction_id: &str) -> Result<bool, DatabaseError>;

    /// `progress` → `cancelled`.
    async fn mark_cancelled(&self, transaction_id: &str) -> Result<bool, DatabaseError>;

    /// `progress` → `payment_failed`, recording the gateway's message.
    async fn mark_payment_failed(
        &self,
        transaction_id: &str,
        message: &str,
    ) -> Result<bool, DatabaseError>;

    /// `paid` or `registration_failed` → `complete`, stamping
    /// `registered = now` and clearing the error message.
    async fn mark_registered(&self, transaction_id: &str) -> Result<bool, DatabaseError>;

    /// `paid` or `registration_failed` → `registration_failed`, recording
    /// the latest registration error.
    async fn mark_registration_failed(
        &self,
        transaction_id: &str,
        message: &str,
    ) -> Result<bool, DatabaseError>;

    /// `registration_failed` → `registration_expired`.
    async fn mark_registration_expired(
        &self,
        transaction_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// `registration_expired` or `fines_updated` → `registration_resolved`
    /// (operator action).
    async fn mark_registration_resolved(
        &self,
        transaction_id: &str,
    ) -> Result<bool, DatabaseError>;

    /// `registration_expired` → `fines_updated` (administrative flagging).
    async fn flag_fines_updated(&self, transaction_id: &str) -> Result<bool, DatabaseError>;

    /// Stamp `reported = now` after an operator report was emitted.
    async fn stamp_reported(&self, transaction_id: &str) -> Result<bool, DatabaseError>;

    /// Does the patron have a `progress` transaction younger than
    /// `stale_after`? Older in-progress rows no longer block: they belong to
    /// abandoned browser sessions.
    async fn has_recent_in_progress(
        &self,
        patron_id: &str,
        stale_after: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Does the patron have a paid-but-unregistered transaction of any age?
    async fn has_unresolved_paid(&self, patron_id: &str) -> Result<bool, DatabaseError>;

    /// Transactions in `paid` or `registration_failed` whose `paid`
    /// timestamp is older than `minimum_paid_age`, ordered by user.
    async fn find_registration_retry_candidates(
        &self,
        minimum_paid_age: Duration,
    ) -> Result<Vec<Transaction>, DatabaseError>;

    /// Transactions in `registration_expired` or `fines_updated` that were
    /// never reported, or whose last report is older than
    /// `minimum_report_interval`.
    async fn find_unresolved_for_reporting(
        &self,
        minimum_report_interval: Duration,
    ) -> Result<Vec<Transaction>, DatabaseError>;
}
