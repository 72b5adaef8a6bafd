use crate::database::transaction::Transaction;
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NotificationType {
    /// Money was taken but registration gave up; an operator must act
    RegistrationExpired,
    /// Fines changed under a paid transaction; manual reconciliation needed
    FinesUpdated,
}

/// Operator reporting sink.
///
/// Guarantees that a human eventually looks at money that was taken but not
/// credited. Delivery is pluggable; this implementation emits structured
/// log events that the operations side alerts on.
pub struct NotificationService;

impl NotificationService {
    pub fn new() -> Self {
        Self
    }

    pub async fn report_unresolved(&self, tx: &Transaction, notification_type: NotificationType) {
        // Placeholder for real delivery (email, ticketing, chat webhook).
        match notification_type {
            NotificationType::RegistrationExpired => {
                error!(
                    transaction_id = %tx.transaction_id,
                    patron_id = %tx.patron_id,
                    status = %tx.status,
                    amount = tx.amount,
                    error_message = tx.error_message.as_deref().unwrap_or(""),
                    "OPERATOR REPORT: paid transaction could not be registered"
                );
            }
            NotificationType::FinesUpdated => {
                error!(
                    transaction_id = %tx.transaction_id,
                    patron_id = %tx.patron_id,
                    status = %tx.status,
                    amount = tx.amount,
                    "OPERATOR REPORT: fines changed under a paid transaction"
                );
            }
        }
    }
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}
