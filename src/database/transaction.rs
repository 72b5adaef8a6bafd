//! Transaction and fee line item entities.
//!
//! A `Transaction` row is the permanent audit record of one payment attempt.
//! Rows are created once, transitioned through the status machine below, and
//! never deleted. Fee line items are written atomically with the transaction
//! and never mutated afterwards, so they stay truthful even when the live
//! fines in the ILS change later.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Transaction status.
///
/// The transition table is total: anything not listed in
/// `valid_transitions` is rejected by the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, user redirected to the gateway, no callback yet
    Progress,
    /// Gateway confirmed the charge; ILS registration not yet done
    Paid,
    /// User cancelled at the gateway
    Cancelled,
    /// Gateway reported the charge failed
    PaymentFailed,
    /// Charge registered in the ILS; fully done
    Complete,
    /// Charge succeeded but the ILS registration call failed
    RegistrationFailed,
    /// Registration retries ran out; needs an operator
    RegistrationExpired,
    /// Fines changed under the transaction; needs manual reconciliation
    FinesUpdated,
    /// An operator resolved the transaction by hand
    RegistrationResolved,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Progress => "progress",
            TransactionStatus::Paid => "paid",
            TransactionStatus::Cancelled => "cancelled",
            TransactionStatus::PaymentFailed => "payment_failed",
            TransactionStatus::Complete => "complete",
            TransactionStatus::RegistrationFailed => "registration_failed",
            TransactionStatus::RegistrationExpired => "registration_expired",
            TransactionStatus::FinesUpdated => "fines_updated",
            TransactionStatus::RegistrationResolved => "registration_resolved",
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status {
            "progress" => Some(TransactionStatus::Progress),
            "paid" => Some(TransactionStatus::Paid),
            "cancelled" => Some(TransactionStatus::Cancelled),
            "payment_failed" => Some(TransactionStatus::PaymentFailed),
            "complete" => Some(TransactionStatus::Complete),
            "registration_failed" => Some(TransactionStatus::RegistrationFailed),
            "registration_expired" => Some(TransactionStatus::RegistrationExpired),
            "fines_updated" => Some(TransactionStatus::FinesUpdated),
            "registration_resolved" => Some(TransactionStatus::RegistrationResolved),
            _ => None,
        }
    }

    /// All states this status may legally move to.
    pub fn valid_transitions(&self) -> &'static [TransactionStatus] {
        match self {
            TransactionStatus::Progress => &[
                TransactionStatus::Paid,
                TransactionStatus::Cancelled,
                TransactionStatus::PaymentFailed,
            ],
            TransactionStatus::Paid => &[
                TransactionStatus::Complete,
                TransactionStatus::RegistrationFailed,
            ],
            TransactionStatus::RegistrationFailed => &[
                TransactionStatus::Complete,
                TransactionStatus::RegistrationExpired,
            ],
            TransactionStatus::RegistrationExpired => &[
                TransactionStatus::FinesUpdated,
                TransactionStatus::RegistrationResolved,
            ],
            TransactionStatus::FinesUpdated => &[TransactionStatus::RegistrationResolved],
            // Terminal states
            TransactionStatus::Cancelled
            | TransactionStatus::PaymentFailed
            | TransactionStatus::Complete
            | TransactionStatus::RegistrationResolved => &[],
        }
    }

    pub fn can_transition_to(&self, target: TransactionStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }

    /// Money was taken but the fines are not registered as paid in the ILS.
    /// Any transaction in one of these states blocks further payment for the
    /// patron until it is resolved, regardless of age.
    pub fn blocks_new_payment(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Paid
                | TransactionStatus::RegistrationFailed
                | TransactionStatus::RegistrationExpired
                | TransactionStatus::FinesUpdated
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One payment attempt.
#[derive(Debug, Clone, FromRow)]
pub struct Transaction {
    /// Internal row id, used as the transaction number handed to the ILS
    pub id: i64,
    /// External correlation key carried through gateway redirects/callbacks
    pub transaction_id: String,
    /// ILS integration the patron's fines belong to
    pub driver: String,
    /// Internal account id of the owner
    pub user_id: String,
    /// Library-card / catalog username known to the ILS
    pub patron_id: String,
    /// Minor currency units, excluding the service fee
    pub amount: i64,
    /// Service charge added on top, minor currency units
    pub transaction_fee: i64,
    pub currency: String,
    pub status: String,
    pub created: chrono::DateTime<chrono::Utc>,
    pub paid: Option<chrono::DateTime<chrono::Utc>>,
    pub registered: Option<chrono::DateTime<chrono::Utc>>,
    pub reported: Option<chrono::DateTime<chrono::Utc>>,
    pub error_message: Option<String>,
}

impl Transaction {
    pub fn status(&self) -> Option<TransactionStatus> {
        TransactionStatus::from_db_status(&self.status)
    }

    /// Total charged to the patron, including the service fee.
    pub fn total_amount(&self) -> i64 {
        self.amount + self.transaction_fee
    }
}

/// Immutable snapshot of one fine included in a transaction.
#[derive(Debug, Clone, FromRow)]
pub struct FeeLineItem {
    pub id: i64,
    pub transaction_id: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub description: String,
    /// Identifier of the original fine in the ILS
    pub fine_reference: String,
    pub fine_type: String,
    pub organization: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_transitions_to_gateway_outcomes() {
        let from = TransactionStatus::Progress;
        assert!(from.can_transition_to(TransactionStatus::Paid));
        assert!(from.can_transition_to(TransactionStatus::Cancelled));
        assert!(from.can_transition_to(TransactionStatus::PaymentFailed));
        assert!(!from.can_transition_to(TransactionStatus::Complete));
    }

    #[test]
    fn paid_transitions_to_registration_outcomes() {
        let from = TransactionStatus::Paid;
        assert!(from.can_transition_to(TransactionStatus::Complete));
        assert!(from.can_transition_to(TransactionStatus::RegistrationFailed));
        assert!(!from.can_transition_to(TransactionStatus::Cancelled));
    }

    #[test]
    fn registration_failed_can_recover_or_expire() {
        let from = TransactionStatus::RegistrationFailed;
        assert!(from.can_transition_to(TransactionStatus::Complete));
        assert!(from.can_transition_to(TransactionStatus::RegistrationExpired));
        assert!(!from.can_transition_to(TransactionStatus::Paid));
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        assert!(TransactionStatus::Complete.is_terminal());
        assert!(TransactionStatus::Cancelled.is_terminal());
        assert!(TransactionStatus::PaymentFailed.is_terminal());
        assert!(TransactionStatus::RegistrationResolved.is_terminal());
        assert!(!TransactionStatus::Progress.is_terminal());
        assert!(!TransactionStatus::Paid.is_terminal());
    }

    #[test]
    fn paid_but_unregistered_states_block_new_payment() {
        assert!(TransactionStatus::Paid.blocks_new_payment());
        assert!(TransactionStatus::RegistrationFailed.blocks_new_payment());
        assert!(TransactionStatus::RegistrationExpired.blocks_new_payment());
        assert!(TransactionStatus::FinesUpdated.blocks_new_payment());

        assert!(!TransactionStatus::Progress.blocks_new_payment());
        assert!(!TransactionStatus::Complete.blocks_new_payment());
        assert!(!TransactionStatus::Cancelled.blocks_new_payment());
        assert!(!TransactionStatus::PaymentFailed.blocks_new_payment());
        assert!(!TransactionStatus::RegistrationResolved.blocks_new_payment());
    }

    #[test]
    fn db_status_round_trips() {
        for status in [
            TransactionStatus::Progress,
            TransactionStatus::Paid,
            TransactionStatus::Cancelled,
            TransactionStatus::PaymentFailed,
            TransactionStatus::Complete,
            TransactionStatus::RegistrationFailed,
            TransactionStatus::RegistrationExpired,
            TransactionStatus::FinesUpdated,
            TransactionStatus::RegistrationResolved,
        ] {
            assert_eq!(
                TransactionStatus::from_db_status(status.as_str()),
                Some(status)
            );
        }
        assert_eq!(TransactionStatus::from_db_status("started"), None);
    }
}
