//! Postgres-backed transaction store.
//!
//! Expected schema:
//!
//! ```sql
//! CREATE TABLE transactions (
//!     id             BIGSERIAL PRIMARY KEY,
//!     transaction_id TEXT NOT NULL UNIQUE,
//!     driver         TEXT NOT NULL,
//!     user_id        TEXT NOT NULL,
//!     patron_id      TEXT NOT NULL,
//!     amount         BIGINT NOT NULL,
//!     transaction_fee BIGINT NOT NULL,
//!     currency       TEXT NOT NULL,
//!     status         TEXT NOT NULL,
//!     created        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     paid           TIMESTAMPTZ,
//!     registered     TIMESTAMPTZ,
//!     reported       TIMESTAMPTZ,
//!     error_message  TEXT
//! );
//!
//! CREATE TABLE transaction_fees (
//!     id             BIGSERIAL PRIMARY KEY,
//!     transaction_id TEXT NOT NULL REFERENCES transactions (transaction_id),
//!     amount         BIGINT NOT NULL,
//!     currency       TEXT NOT NULL,
//!     description    TEXT NOT NULL,
//!     fine_reference TEXT NOT NULL,
//!     fine_type      TEXT NOT NULL,
//!     organization   TEXT
//! );
//! ```

use crate::database::error::DatabaseError;
use crate::database::store::{NewFeeLineItem, NewTransaction, TransactionStore};
use crate::database::transaction::{FeeLineItem, Transaction, TransactionStatus};
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

const TRANSACTION_COLUMNS: &str = "id, transaction_id, driver, user_id, patron_id, amount, \
     transaction_fee, currency, status, created, paid, registered, reported, error_message";

pub struct TransactionRepository {
    pool: PgPool,
}

impl TransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Compare-and-swap the status. The WHERE clause carries the allowed
    /// source statuses, so a concurrent writer that got there first makes
    /// this a no-op instead of a lost update.
    async fn transition(
        &self,
        transaction_id: &str,
        from: &[TransactionStatus],
        to: TransactionStatus,
        extra_set: &str,
        message: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let from_statuses: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let query = format!(
            "UPDATE transactions SET status = $2{} WHERE transaction_id = $1 AND status = ANY($3)",
            extra_set
        );

        let mut q = sqlx::query(&query)
            .bind(transaction_id)
            .bind(to.as_str())
            .bind(&from_statuses);
        if let Some(message) = message {
            q = q.bind(message);
        }

        let result = q
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TransactionStore for TransactionRepository {
    async fn create_transaction(
        &self,
        new: NewTransaction,
        fees: Vec<NewFeeLineItem>,
    ) -> Result<Transaction, DatabaseError> {
        let mut db_tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let transaction = sqlx::query_as::<_, Transaction>(&format!(
            "INSERT INTO transactions \
             (transaction_id, driver, user_id, patron_id, amount, transaction_fee, currency, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {}",
            TRANSACTION_COLUMNS
        ))
        .bind(&new.transaction_id)
        .bind(&new.driver)
        .bind(&new.user_id)
        .bind(&new.patron_id)
        .bind(new.amount)
        .bind(new.transaction_fee)
        .bind(&new.currency)
        .bind(TransactionStatus::Progress.as_str())
        .fetch_one(&mut *db_tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        for fee in &fees {
            sqlx::query(
                "INSERT INTO transaction_fees \
                 (transaction_id, amount, currency, description, fine_reference, fine_type, organization) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&new.transaction_id)
            .bind(fee.amount)
            .bind(&fee.currency)
            .bind(&fee.description)
            .bind(&fee.fine_reference)
            .bind(&fee.fine_type)
            .bind(&fee.organization)
            .execute(&mut *db_tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }

        db_tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(transaction)
    }

    async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, DatabaseError> {
        sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE transaction_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn fees_for_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<FeeLineItem>, DatabaseError> {
        sqlx::query_as::<_, FeeLineItem>(
            "SELECT id, transaction_id, amount, currency, description, fine_reference, \
                    fine_type, organization \
             FROM transaction_fees WHERE transaction_id = $1 ORDER BY id",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn mark_paid(&self, transaction_id: &str) -> Result<bool, DatabaseError> {
        self.transition(
            transaction_id,
            &[TransactionStatus::Progress],
            TransactionStatus::Paid,
            ", paid = NOW()",
            None,
        )
        .await
    }

    async fn mark_cancelled(&self, transaction_id: &str) -> Result<bool, DatabaseError> {
        self.transition(
            transaction_id,
            &[TransactionStatus::Progress],
            TransactionStatus::Cancelled,
            "",
            None,
        )
        .await
    }

    async fn mark_payment_failed(
        &self,
        transaction_id: &str,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        self.transition(
            transaction_id,
            &[TransactionStatus::Progress],
            TransactionStatus::PaymentFailed,
            ", error_message = $4",
            Some(message),
        )
        .await
    }

    async fn mark_registered(&self, transaction_id: &str) -> Result<bool, DatabaseError> {
        self.transition(
            transaction_id,
            &[
                TransactionStatus::Paid,
                TransactionStatus::RegistrationFailed,
            ],
            TransactionStatus::Complete,
            ", registered = NOW(), error_message = NULL",
            None,
        )
        .await
    }

    async fn mark_registration_failed(
        &self,
        transaction_id: &str,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        self.transition(
            transaction_id,
            &[
                TransactionStatus::Paid,
                TransactionStatus::RegistrationFailed,
            ],
            TransactionStatus::RegistrationFailed,
            ", error_message = $4",
            Some(message),
        )
        .await
    }

    async fn mark_registration_expired(
        &self,
        transaction_id: &str,
    ) -> Result<bool, DatabaseError> {
        self.transition(
            transaction_id,
            &[TransactionStatus::RegistrationFailed],
            TransactionStatus::RegistrationExpired,
            "",
            None,
        )
        .await
    }

    async fn mark_registration_resolved(
        &self,
        transaction_id: &str,
    ) -> Result<bool, DatabaseError> {
        self.transition(
            transaction_id,
            &[
                TransactionStatus::RegistrationExpired,
                TransactionStatus::FinesUpdated,
            ],
            TransactionStatus::RegistrationResolved,
            "",
            None,
        )
        .await
    }

    async fn flag_fines_updated(&self, transaction_id: &str) -> Result<bool, DatabaseError> {
        self.transition(
            transaction_id,
            &[TransactionStatus::RegistrationExpired],
            TransactionStatus::FinesUpdated,
            "",
            None,
        )
        .await
    }

    async fn stamp_reported(&self, transaction_id: &str) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE transactions SET reported = NOW() WHERE transaction_id = $1")
                .bind(transaction_id)
                .execute(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn has_recent_in_progress(
        &self,
        patron_id: &str,
        stale_after: Duration,
    ) -> Result<bool, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transactions \
             WHERE patron_id = $1 AND status = $2 \
               AND created > NOW() - ($3 * INTERVAL '1 second')",
        )
        .bind(patron_id)
        .bind(TransactionStatus::Progress.as_str())
        .bind(stale_after.as_secs() as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(count > 0)
    }

    async fn has_unresolved_paid(&self, patron_id: &str) -> Result<bool, DatabaseError> {
        let blocking: Vec<String> = [
            TransactionStatus::Paid,
            TransactionStatus::RegistrationFailed,
            TransactionStatus::RegistrationExpired,
            TransactionStatus::FinesUpdated,
        ]
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transactions WHERE patron_id = $1 AND status = ANY($2)",
        )
        .bind(patron_id)
        .bind(&blocking)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(count > 0)
    }

    async fn find_registration_retry_candidates(
        &self,
        minimum_paid_age: Duration,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let statuses: Vec<String> = [
            TransactionStatus::Paid,
            TransactionStatus::RegistrationFailed,
        ]
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();

        sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions \
             WHERE status = ANY($1) AND paid IS NOT NULL \
               AND paid < NOW() - ($2 * INTERVAL '1 second') \
             ORDER BY user_id, paid",
            TRANSACTION_COLUMNS
        ))
        .bind(&statuses)
        .bind(minimum_paid_age.as_secs() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_unresolved_for_reporting(
        &self,
        minimum_report_interval: Duration,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let statuses: Vec<String> = [
            TransactionStatus::RegistrationExpired,
            TransactionStatus::FinesUpdated,
        ]
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();

        sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions \
             WHERE status = ANY($1) AND paid IS NOT NULL \
               AND (reported IS NULL OR reported < NOW() - ($2 * INTERVAL '1 second')) \
             ORDER BY user_id, paid",
            TRANSACTION_COLUMNS
        ))
        .bind(&statuses)
        .bind(minimum_report_interval.as_secs() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
