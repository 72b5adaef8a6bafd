//! In-memory transaction store.
//!
//! Same compare-and-swap semantics as the Postgres repository, backed by a
//! `RwLock`-protected map. Used by the integration tests and handy for local
//! development without a database.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::store::{NewFeeLineItem, NewTransaction, TransactionStore};
use crate::database::transaction::{FeeLineItem, Transaction, TransactionStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryTransactionStore {
    transactions: RwLock<HashMap<String, Transaction>>,
    fees: RwLock<HashMap<String, Vec<FeeLineItem>>>,
    next_id: AtomicI64,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            fees: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Test hook: overwrite a row's timestamps to simulate age.
    pub async fn backdate(
        &self,
        transaction_id: &str,
        created: Option<chrono::DateTime<Utc>>,
        paid: Option<chrono::DateTime<Utc>>,
    ) {
        let mut transactions = self.transactions.write().await;
        if let Some(tx) = transactions.get_mut(transaction_id) {
            if let Some(created) = created {
                tx.created = created;
            }
            if paid.is_some() {
                tx.paid = paid;
            }
        }
    }

    pub async fn get(&self, transaction_id: &str) -> Option<Transaction> {
        self.transactions.read().await.get(transaction_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn all(&self) -> Vec<Transaction> {
        self.transactions.read().await.values().cloned().collect()
    }

    async fn cas(
        &self,
        transaction_id: &str,
        from: &[TransactionStatus],
        apply: impl FnOnce(&mut Transaction),
    ) -> Result<bool, DatabaseError> {
        let mut transactions = self.transactions.write().await;
        let Some(tx) = transactions.get_mut(transaction_id) else {
            return Ok(false);
        };
        let Some(current) = TransactionStatus::from_db_status(&tx.status) else {
            return Err(DatabaseError::new(DatabaseErrorKind::Unknown {
                message: format!("corrupt status '{}' on {}", tx.status, transaction_id),
            }));
        };
        if !from.contains(&current) {
            return Ok(false);
        }
        apply(tx);
        Ok(true)
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn create_transaction(
        &self,
        new: NewTransaction,
        fees: Vec<NewFeeLineItem>,
    ) -> Result<Transaction, DatabaseError> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&new.transaction_id) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: Some("transactions_transaction_id_key".to_string()),
            }));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let transaction = Transaction {
            id,
            transaction_id: new.transaction_id.clone(),
            driver: new.driver,
            user_id: new.user_id,
            patron_id: new.patron_id,
            amount: new.amount,
            transaction_fee: new.transaction_fee,
            currency: new.currency.clone(),
            status: TransactionStatus::Progress.as_str().to_string(),
            created: Utc::now(),
            paid: None,
            registered: None,
            reported: None,
            error_message: None,
        };
        transactions.insert(new.transaction_id.clone(), transaction.clone());

        let items = fees
            .into_iter()
            .enumerate()
            .map(|(i, fee)| FeeLineItem {
                id: id * 1000 + i as i64,
                transaction_id: new.transaction_id.clone(),
                amount: fee.amount,
                currency: fee.currency,
                description: fee.description,
                fine_reference: fee.fine_reference,
                fine_type: fee.fine_type,
                organization: fee.organization,
            })
            .collect();
        self.fees
            .write()
            .await
            .insert(new.transaction_id.clone(), items);

        Ok(transaction)
    }

    async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, DatabaseError> {
        Ok(self.transactions.read().await.get(transaction_id).cloned())
    }

    async fn fees_for_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<FeeLineItem>, DatabaseError> {
        Ok(self
            .fees
            .read()
            .await
            .get(transaction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_paid(&self, transaction_id: &str) -> Result<bool, DatabaseError> {
        self.cas(transaction_id, &[TransactionStatus::Progress], |tx| {
            tx.status = TransactionStatus::Paid.as_str().to_string();
            tx.paid = Some(Utc::now());
        })
        .await
    }

    async fn mark_cancelled(&self, transaction_id: &str) -> Result<bool, DatabaseError> {
        self.cas(transaction_id, &[TransactionStatus::Progress], |tx| {
            tx.status = TransactionStatus::Cancelled.as_str().to_string();
        })
        .await
    }

    async fn mark_payment_failed(
        &self,
        transaction_id: &str,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        self.cas(transaction_id, &[TransactionStatus::Progress], |tx| {
            tx.status = TransactionStatus::PaymentFailed.as_str().to_string();
            tx.error_message = Some(message.to_string());
        })
        .await
    }

    async fn mark_registered(&self, transaction_id: &str) -> Result<bool, DatabaseError> {
        self.cas(
            transaction_id,
            &[
                TransactionStatus::Paid,
                TransactionStatus::RegistrationFailed,
            ],
            |tx| {
                tx.status = TransactionStatus::Complete.as_str().to_string();
                tx.registered = Some(Utc::now());
                tx.error_message = None;
            },
        )
        .await
    }

    async fn mark_registration_failed(
        &self,
        transaction_id: &str,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        self.cas(
            transaction_id,
            &[
                TransactionStatus::Paid,
                TransactionStatus::RegistrationFailed,
            ],
            |tx| {
                tx.status = TransactionStatus::RegistrationFailed.as_str().to_string();
                tx.error_message = Some(message.to_string());
            },
        )
        .await
    }

    async fn mark_registration_expired(
        &self,
        transaction_id: &str,
    ) -> Result<bool, DatabaseError> {
        self.cas(
            transaction_id,
            &[TransactionStatus::RegistrationFailed],
            |tx| {
                tx.status = TransactionStatus::RegistrationExpired.as_str().to_string();
            },
        )
        .await
    }

    async fn mark_registration_resolved(
        &self,
        transaction_id: &str,
    ) -> Result<bool, DatabaseError> {
        self.cas(
            transaction_id,
            &[
                TransactionStatus::RegistrationExpired,
                TransactionStatus::FinesUpdated,
            ],
            |tx| {
                tx.status = TransactionStatus::RegistrationResolved.as_str().to_string();
            },
        )
        .await
    }

    async fn flag_fines_updated(&self, transaction_id: &str) -> Result<bool, DatabaseError> {
        self.cas(
            transaction_id,
            &[TransactionStatus::RegistrationExpired],
            |tx| {
                tx.status = TransactionStatus::FinesUpdated.as_str().to_string();
            },
        )
        .await
    }

    async fn stamp_reported(&self, transaction_id: &str) -> Result<bool, DatabaseError> {
        let mut transactions = self.transactions.write().await;
        match transactions.get_mut(transaction_id) {
            Some(tx) => {
                tx.reported = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn has_recent_in_progress(
        &self,
        patron_id: &str,
        stale_after: Duration,
    ) -> Result<bool, DatabaseError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        Ok(self.transactions.read().await.values().any(|tx| {
            tx.patron_id == patron_id
                && tx.status == TransactionStatus::Progress.as_str()
                && tx.created > cutoff
        }))
    }

    async fn has_unresolved_paid(&self, patron_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.transactions.read().await.values().any(|tx| {
            tx.patron_id == patron_id
                && tx
                    .status()
                    .map(|s| s.blocks_new_payment())
                    .unwrap_or(false)
        }))
    }

    async fn find_registration_retry_candidates(
        &self,
        minimum_paid_age: Duration,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(minimum_paid_age).unwrap_or(chrono::Duration::zero());
        let mut candidates: Vec<Transaction> = self
            .transactions
            .read()
            .await
            .values()
            .filter(|tx| {
                matches!(
                    tx.status(),
                    Some(TransactionStatus::Paid) | Some(TransactionStatus::RegistrationFailed)
                ) && tx.paid.map(|paid| paid < cutoff).unwrap_or(false)
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| (&a.user_id, a.paid).cmp(&(&b.user_id, b.paid)));
        Ok(candidates)
    }

    async fn find_unresolved_for_reporting(
        &self,
        minimum_report_interval: Duration,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(minimum_report_interval)
                .unwrap_or(chrono::Duration::zero());
        let mut unresolved: Vec<Transaction> = self
            .transactions
            .read()
            .await
            .values()
            .filter(|tx| {
                matches!(
                    tx.status(),
                    Some(TransactionStatus::RegistrationExpired)
                        | Some(TransactionStatus::FinesUpdated)
                ) && tx.paid.is_some()
                    && tx.reported.map(|r| r < cutoff).unwrap_or(true)
            })
            .cloned()
            .collect();
        unresolved.sort_by(|a, b| (&a.user_id, a.paid).cmp(&(&b.user_id, b.paid)));
        Ok(unresolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_new(id: &str, patron: &str) -> NewTransaction {
        NewTransaction {
            transaction_id: id.to_string(),
            driver: "helmet".to_string(),
            user_id: "42".to_string(),
            patron_id: patron.to_string(),
            amount: 550,
            transaction_fee: 50,
            currency: "EUR".to_string(),
        }
    }

    #[tokio::test]
    async fn create_then_find_round_trips() {
        let store = InMemoryTransactionStore::new();
        store
            .create_transaction(sample_new("t1", "lib.1234"), vec![])
            .await
            .expect("create should succeed");

        let tx = store
            .find_by_transaction_id("t1")
            .await
            .expect("find should succeed")
            .expect("row should exist");
        assert_eq!(tx.status(), Some(TransactionStatus::Progress));
        assert_eq!(tx.total_amount(), 600);
    }

    #[tokio::test]
    async fn duplicate_transaction_id_is_rejected() {
        let store = InMemoryTransactionStore::new();
        store
            .create_transaction(sample_new("t1", "lib.1234"), vec![])
            .await
            .expect("first create should succeed");
        let err = store
            .create_transaction(sample_new("t1", "lib.1234"), vec![])
            .await
            .expect_err("second create should fail");
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn mark_paid_is_idempotent() {
        let store = InMemoryTransactionStore::new();
        store
            .create_transaction(sample_new("t1", "lib.1234"), vec![])
            .await
            .expect("create should succeed");

        assert!(store.mark_paid("t1").await.expect("first mark_paid"));
        assert!(!store.mark_paid("t1").await.expect("second mark_paid"));

        let tx = store.get("t1").await.expect("row should exist");
        assert_eq!(tx.status(), Some(TransactionStatus::Paid));
        assert!(tx.paid.is_some());
    }

    #[tokio::test]
    async fn stale_in_progress_does_not_count_as_recent() {
        let store = InMemoryTransactionStore::new();
        store
            .create_transaction(sample_new("t1", "lib.1234"), vec![])
            .await
            .expect("create should succeed");
        store
            .backdate("t1", Some(Utc::now() - chrono::Duration::hours(2)), None)
            .await;

        let recent = store
            .has_recent_in_progress("lib.1234", Duration::from_secs(1800))
            .await
            .expect("query should succeed");
        assert!(!recent);
    }
}
