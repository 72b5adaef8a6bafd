//! Single-flight payment guard.
//!
//! "In progress" is a soft lock with a timeout: an abandoned browser tab
//! stops blocking once the transaction is older than `stale_after`. A paid
//! but unregistered transaction is a hard block at any age, because paying
//! twice for the same fines must never be possible.

use crate::database::error::DatabaseError;
use crate::database::store::TransactionStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// A payment for this patron is already in flight
    InProgress,
    /// An earlier charge was taken but never registered in the ILS
    PriorUnresolved,
}

impl DenialReason {
    /// Translation key surfaced to the UI.
    pub fn message_key(&self) -> &'static str {
        match self {
            DenialReason::InProgress => "online_payment_in_progress",
            DenialReason::PriorUnresolved => "online_payment_registration_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitDecision {
    Permitted,
    Denied(DenialReason),
}

impl PermitDecision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, PermitDecision::Permitted)
    }
}

pub struct PaymentGuard {
    store: Arc<dyn TransactionStore>,
    // One lock per patron so guard-check + persist in start() is atomic per
    // patron; the map itself is only held long enough to clone the entry.
    patron_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PaymentGuard {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self {
            store,
            patron_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_payment_permitted(
        &self,
        patron_id: &str,
        stale_after: Duration,
    ) -> Result<PermitDecision, DatabaseError> {
        if self
            .store
            .has_recent_in_progress(patron_id, stale_after)
            .await?
        {
            return Ok(PermitDecision::Denied(DenialReason::InProgress));
        }

        if self.store.has_unresolved_paid(patron_id).await? {
            return Ok(PermitDecision::Denied(DenialReason::PriorUnresolved));
        }

        Ok(PermitDecision::Permitted)
    }

    /// Serialization handle for `start()`; two concurrent starts for the
    /// same patron contend on the same mutex.
    pub async fn patron_lock(&self, patron_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.patron_locks.lock().await;
        Arc::clone(
            locks
                .entry(patron_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}
