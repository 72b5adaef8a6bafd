//! Library-management-system (ILS) collaborator.
//!
//! The ILS owns the fines and is the system of record for "these fees are
//! paid". This module defines the seam the payment core talks through; the
//! HTTP client in `client` is one implementation, tests substitute mocks.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::IlsHttpClient;

pub type IlsResult<T> = Result<T, IlsError>;

#[derive(Debug, Clone, Error)]
pub enum IlsError {
    #[error("ILS network error: {message}")]
    Network { message: String },

    #[error("ILS request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("ILS rejected the request: {message}")]
    Rejected { message: String },

    #[error("invalid ILS response: {message}")]
    InvalidResponse { message: String },
}

/// The patron as the ILS knows them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatronAccount {
    /// ILS integration the account lives in
    pub driver: String,
    /// Catalog username / library card barcode
    pub patron_id: String,
    /// Internal account id of the logged-in user
    pub user_id: String,
    pub email: Option<String>,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub language: Option<String>,
}

/// One fine as reported by the ILS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fine {
    pub fine_reference: String,
    pub fine_type: String,
    pub title: Option<String>,
    pub organization: Option<String>,
    /// Outstanding balance in minor currency units
    pub balance: i64,
    pub currency: String,
    pub payable_online: bool,
}

/// Result of asking the ILS what is actually payable right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayableCheck {
    pub payable: bool,
    /// Total payable amount in minor units, excluding any service fee
    pub amount: i64,
    pub fines: Vec<Fine>,
    pub reason: Option<String>,
}

#[async_trait]
pub trait IlsConnector: Send + Sync {
    /// Authoritative payable amount and line items for the patron, limited
    /// to `selected_fine_ids` when non-empty.
    async fn get_payable_fines(
        &self,
        patron: &PatronAccount,
        selected_fine_ids: &[String],
    ) -> IlsResult<PayableCheck>;

    /// Register a completed charge in the ILS. Returns `false` when the ILS
    /// refuses without raising a transport error; both count as a failed
    /// registration.
    async fn mark_fees_as_paid(
        &self,
        patron: &PatronAccount,
        amount: i64,
        transaction_id: &str,
        transaction_number: i64,
        fine_ids: &[String],
    ) -> IlsResult<bool>;
}
