//! Unified error handling for the patronpay backend.
//!
//! One `AppError` type with proper HTTP status mapping, user-facing
//! messages, and structured error codes for client handling. Registration
//! failures after a successful charge are deliberately NOT representable as
//! user-facing payment failures here: they are recorded on the transaction
//! row and resolved by the reconciler, while the user sees success.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "PAYMENT_IN_PROGRESS")]
    PaymentInProgress,
    #[serde(rename = "PRIOR_PAYMENT_UNRESOLVED")]
    PriorPaymentUnresolved,
    #[serde(rename = "FINES_CHANGED")]
    FinesChanged,
    #[serde(rename = "FINES_NOT_PAYABLE")]
    FinesNotPayable,
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "DUPLICATE_TRANSACTION")]
    DuplicateTransaction,
    #[serde(rename = "INVALID_TRANSACTION_STATE")]
    InvalidTransactionState,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_GATEWAY_ERROR")]
    PaymentGatewayError,
    #[serde(rename = "ILS_ERROR")]
    IlsError,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Domain-specific business logic errors
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Patron already has a payment in flight
    PaymentInProgress { patron_id: String },
    /// An earlier charge was taken but never registered in the ILS
    PriorPaymentUnresolved { patron_id: String },
    /// Fines changed between display and submit
    FinesChanged { patron_id: String },
    /// Nothing payable online, or below the minimum
    FinesNotPayable { reason: String },
    /// Transaction with given ID doesn't exist
    TransactionNotFound { transaction_id: String },
    /// Duplicate transaction attempt
    DuplicateTransaction { transaction_id: String },
    /// The requested action does not apply to the transaction's status
    InvalidTransactionState {
        transaction_id: String,
        action: String,
    },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Configuration { message: String },
}

/// External service errors (payment gateway, ILS)
#[derive(Debug, Clone)]
pub enum ExternalError {
    PaymentGateway {
        gateway: String,
        message: String,
        is_retryable: bool,
    },
    Ils {
        message: String,
        is_retryable: bool,
    },
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
    Timeout {
        service: String,
        timeout_secs: u64,
    },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    MissingField {
        field: String,
    },
    InvalidAmount {
        amount: String,
        reason: String,
    },
    InvalidCurrency {
        currency: String,
        reason: String,
    },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentInProgress { .. } => 409,
                DomainError::PriorPaymentUnresolved { .. } => 409,
                DomainError::FinesChanged { .. } => 409,
                DomainError::FinesNotPayable { .. } => 422,
                DomainError::TransactionNotFound { .. } => 404,
                DomainError::DuplicateTransaction { .. } => 409,
                DomainError::InvalidTransactionState { .. } => 409,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => 500,
                InfrastructureError::Configuration { .. } => 500,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { .. } => 502,
                ExternalError::Ils { .. } => 502,
                ExternalError::RateLimit { .. } => 429,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentInProgress { .. } => ErrorCode::PaymentInProgress,
                DomainError::PriorPaymentUnresolved { .. } => ErrorCode::PriorPaymentUnresolved,
                DomainError::FinesChanged { .. } => ErrorCode::FinesChanged,
                DomainError::FinesNotPayable { .. } => ErrorCode::FinesNotPayable,
                DomainError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
                DomainError::DuplicateTransaction { .. } => ErrorCode::DuplicateTransaction,
                DomainError::InvalidTransactionState { .. } => {
                    ErrorCode::InvalidTransactionState
                }
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { .. } => ErrorCode::PaymentGatewayError,
                ExternalError::Ils { .. } => ErrorCode::IlsError,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::PaymentInProgress { .. } => {
                    "A payment is already in progress. Please wait for it to finish".to_string()
                }
                DomainError::PriorPaymentUnresolved { .. } => {
                    "An earlier payment is still being processed. Please contact the library if this persists"
                        .to_string()
                }
                DomainError::FinesChanged { .. } => {
                    "Your fines have changed. Please review the updated list before paying"
                        .to_string()
                }
                DomainError::FinesNotPayable { reason } => {
                    format!("These fines cannot be paid online: {}", reason)
                }
                DomainError::TransactionNotFound { transaction_id } => {
                    format!("Payment '{}' not found", transaction_id)
                }
                DomainError::DuplicateTransaction { transaction_id } => {
                    format!("Payment '{}' already exists", transaction_id)
                }
                DomainError::InvalidTransactionState {
                    transaction_id,
                    action,
                } => {
                    format!(
                        "Payment '{}' is not in a state that allows {}",
                        transaction_id, action
                    )
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { is_retryable, .. } => {
                    if *is_retryable {
                        "The payment service is temporarily unavailable. Please try again"
                            .to_string()
                    } else {
                        "Payment could not be started. No charge was made".to_string()
                    }
                }
                ExternalError::Ils { .. } => {
                    "The library system is temporarily unavailable. Please try again".to_string()
                }
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => match retry_after {
                    Some(secs) => format!(
                        "Rate limit exceeded for {}. Please try again in {} seconds",
                        service, secs
                    ),
                    None => format!("Rate limit exceeded for {}. Please try again later", service),
                },
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::InvalidCurrency { currency, reason } => {
                    format!("Invalid currency '{}': {}", currency, reason)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentGateway { is_retryable, .. } => *is_retryable,
                ExternalError::Ils { is_retryable, .. } => *is_retryable,
                ExternalError::RateLimit { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

impl From<crate::ils::IlsError> for AppError {
    fn from(err: crate::ils::IlsError) -> Self {
        use crate::ils::IlsError;

        let kind = match err {
            IlsError::Timeout { timeout_secs } => AppErrorKind::External(ExternalError::Timeout {
                service: "ILS".to_string(),
                timeout_secs,
            }),
            IlsError::Network { message } => AppErrorKind::External(ExternalError::Ils {
                message,
                is_retryable: true,
            }),
            IlsError::Rejected { message } | IlsError::InvalidResponse { message } => {
                AppErrorKind::External(ExternalError::Ils {
                    message,
                    is_retryable: false,
                })
            }
        };
        AppError::new(kind)
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
