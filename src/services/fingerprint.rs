//! Payment fingerprint guard.
//!
//! Fines can change between the moment the fines page is rendered and the
//! moment the user submits the payment (another session paid some, a fine
//! was waived). The fingerprint captures "what the user was shown to pay"
//! when fines are displayed and is compared again at submit time, so a
//! stale total is caught without any global lock. Pure computation; the
//! caller keeps the stored fingerprint in request-scoped state.

use crate::ils::PatronAccount;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentFingerprint {
    /// Digest of the patron identity at display time
    pub session_id: String,
    /// Payable amount at display time, minor units, excluding fees
    pub amount: i64,
}

/// Deterministic digest of the patron identity object.
pub fn identity_digest(patron: &PatronAccount) -> String {
    let canonical =
        serde_json::to_string(patron).expect("patron account serialization cannot fail");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Capture the fingerprint when fines are displayed.
pub fn snapshot(patron: &PatronAccount, amount: i64) -> PaymentFingerprint {
    PaymentFingerprint {
        session_id: identity_digest(patron),
        amount,
    }
}

/// True when the identity digest or the payable amount no longer matches
/// what was stored at display time.
pub fn has_changed(
    stored: &PaymentFingerprint,
    patron: &PatronAccount,
    current_amount: i64,
) -> bool {
    let mut changed = false;

    let current_digest = identity_digest(patron);
    if stored.session_id != current_digest {
        error!(
            patron_id = %patron.patron_id,
            stored_digest = %stored.session_id,
            current_digest = %current_digest,
            "payment session fingerprint does not match"
        );
        changed = true;
    }
    if stored.amount != current_amount {
        error!(
            patron_id = %patron.patron_id,
            stored_amount = stored.amount,
            current_amount = current_amount,
            "payable amount changed since fines were displayed"
        );
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patron() -> PatronAccount {
        PatronAccount {
            driver: "helmet".to_string(),
            patron_id: "lib.1234".to_string(),
            user_id: "42".to_string(),
            email: Some("patron@example.com".to_string()),
            firstname: Some("Aino".to_string()),
            lastname: Some("Virtanen".to_string()),
            language: Some("fi".to_string()),
        }
    }

    #[test]
    fn snapshot_is_deterministic() {
        let a = snapshot(&patron(), 550);
        let b = snapshot(&patron(), 550);
        assert_eq!(a, b);
        assert_eq!(a.session_id.len(), 64);
    }

    #[test]
    fn unchanged_patron_and_amount_pass() {
        let stored = snapshot(&patron(), 550);
        assert!(!has_changed(&stored, &patron(), 550));
    }

    #[test]
    fn amount_change_is_detected() {
        let stored = snapshot(&patron(), 550);
        assert!(has_changed(&stored, &patron(), 300));
    }

    #[test]
    fn identity_change_is_detected() {
        let stored = snapshot(&patron(), 550);
        let mut other = patron();
        other.patron_id = "lib.9999".to_string();
        assert!(has_changed(&stored, &other, 550));
    }
}
