use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Callback signature verification failed: {message}")]
    SignatureError { message: String },

    #[error("Missing callback parameter: {name}")]
    MissingCallbackParameter { name: String },

    #[error("Gateway error: gateway={gateway}, message={message}")]
    GatewayError {
        gateway: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::ConfigurationError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::SignatureError { .. } => false,
            PaymentError::MissingCallbackParameter { .. } => false,
            PaymentError::GatewayError { retryable, .. } => *retryable,
        }
    }

    /// Errors that must discard the callback without mutating any state.
    pub fn is_callback_rejection(&self) -> bool {
        matches!(
            self,
            PaymentError::SignatureError { .. } | PaymentError::MissingCallbackParameter { .. }
        )
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::ConfigurationError { .. } => 500,
            PaymentError::NetworkError { .. } => 503,
            PaymentError::RateLimitError { .. } => 429,
            PaymentError::SignatureError { .. } => 401,
            PaymentError::MissingCallbackParameter { .. } => 400,
            PaymentError::GatewayError { .. } => 502,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::ConfigurationError { .. } => {
                "Online payment is not available right now".to_string()
            }
            PaymentError::NetworkError { .. } => {
                "Payment service is temporarily unavailable".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to the payment service. Please retry shortly".to_string()
            }
            PaymentError::SignatureError { .. } => "Invalid payment response".to_string(),
            PaymentError::MissingCallbackParameter { .. } => {
                "Invalid payment response".to_string()
            }
            PaymentError::GatewayError { .. } => {
                "The payment service returned an error".to_string()
            }
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, InfrastructureError};

        let kind = match &err {
            PaymentError::ConfigurationError { message } => {
                AppErrorKind::Infrastructure(InfrastructureError::Configuration {
                    message: message.clone(),
                })
            }
            _ => AppErrorKind::External(ExternalError::PaymentGateway {
                gateway: "payments".to_string(),
                message: err.to_string(),
                is_retryable: err.is_retryable(),
            }),
        };
        AppError::new(kind)
    }
}
